#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **soc-playbook** – Pure, static lookup from an event type to a fixed
//! list of suggested remediation actions.

/// Suggested actions for authentication-related incidents.
pub const AUTH_PLAYBOOK: &[&str] = &[
    "Check recent password change for the user.",
    "Review MFA enrollment and recent device logins.",
    "Temporarily lock account after threshold breaches.",
];

/// Suggested actions for port-scan incidents.
pub const PORT_SCAN_PLAYBOOK: &[&str] = &[
    "Block offending IP at edge firewall.",
    "Run quick vuln scan on targeted subnet.",
    "Open incident with NOC for monitoring.",
];

/// Suggested actions when no more specific playbook matches.
pub const DEFAULT_PLAYBOOK: &[&str] = &[
    "Review logs and validate if benign.",
    "Add to allowlist/blocklist as needed.",
    "Document in ticket and close or escalate.",
];

/// Suggest a list of actions for an event type.
///
/// Substring match on `"auth"`/`"login"` selects the auth playbook,
/// `"scan"`/`"nmap"` selects the port-scan playbook, otherwise the default.
pub fn suggest_actions(event_type: &str) -> Vec<String> {
    let et = event_type.to_lowercase();
    let playbook = if et.contains("auth") || et.contains("login") {
        AUTH_PLAYBOOK
    } else if et.contains("scan") || et.contains("nmap") {
        PORT_SCAN_PLAYBOOK
    } else {
        DEFAULT_PLAYBOOK
    };
    playbook.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_types_get_auth_playbook() {
        assert_eq!(suggest_actions("auth_failure"), AUTH_PLAYBOOK.to_vec());
        assert_eq!(suggest_actions("login_attempt"), AUTH_PLAYBOOK.to_vec());
    }

    #[test]
    fn scan_types_get_port_scan_playbook() {
        assert_eq!(suggest_actions("port_scan"), PORT_SCAN_PLAYBOOK.to_vec());
        assert_eq!(suggest_actions("nmap_detected"), PORT_SCAN_PLAYBOOK.to_vec());
    }

    #[test]
    fn unknown_types_get_default_playbook() {
        assert_eq!(suggest_actions("disk_full"), DEFAULT_PLAYBOOK.to_vec());
        assert_eq!(suggest_actions(""), DEFAULT_PLAYBOOK.to_vec());
    }
}
