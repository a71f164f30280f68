// ABOUTME: Naming and labelling conventions for session containers and networks
// ABOUTME: Labels let orphaned resources be found again after a restart

use std::collections::HashMap;

pub const SESSION_LABEL: &str = "lab.session";
pub const PROJECT_LABEL: &str = "lab.project";
pub const CONTAINER_LABEL: &str = "lab.container";
pub const SIDECAR_LABEL: &str = "lab.sidecar";

const NETWORK_PREFIX: &str = "lab-session-";

pub fn container_name(session_id: &str, container_id: &str) -> String {
    format!("lab-{}-{}", session_id, container_id)
}

pub fn network_name(session_id: &str) -> String {
    format!("{}{}", NETWORK_PREFIX, session_id)
}

/// Session id encoded in a session network name, if it is one.
pub fn session_from_network(name: &str) -> Option<&str> {
    name.strip_prefix(NETWORK_PREFIX).filter(|id| !id.is_empty())
}

pub fn session_labels(session_id: &str, project_id: &str) -> HashMap<String, String> {
    HashMap::from([
        (SESSION_LABEL.to_string(), session_id.to_string()),
        (PROJECT_LABEL.to_string(), project_id.to_string()),
    ])
}

pub fn container_labels(
    session_id: &str,
    project_id: &str,
    container_id: &str,
) -> HashMap<String, String> {
    let mut labels = session_labels(session_id, project_id);
    labels.insert(CONTAINER_LABEL.to_string(), container_id.to_string());
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_name_round_trip() {
        let name = network_name("ses_1");
        assert_eq!(name, "lab-session-ses_1");
        assert_eq!(session_from_network(&name), Some("ses_1"));
        assert_eq!(session_from_network("bridge"), None);
        assert_eq!(session_from_network("lab-session-"), None);
    }

    #[test]
    fn test_container_labels() {
        let labels = container_labels("s1", "p1", "c1");
        assert_eq!(labels.get(SESSION_LABEL).unwrap(), "s1");
        assert_eq!(labels.get(PROJECT_LABEL).unwrap(), "p1");
        assert_eq!(labels.get(CONTAINER_LABEL).unwrap(), "c1");
        assert_eq!(container_name("s1", "c1"), "lab-s1-c1");
    }
}
