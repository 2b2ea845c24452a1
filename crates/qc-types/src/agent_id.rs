//! Agent identifier generation.
//!
//! Agent ids follow the pattern `agent-<8 lowercase hex>`; the short UUID
//! slice keeps them unique enough for a fleet while staying readable in
//! logs and mailbox names.

use uuid::Uuid;

/// Prefix shared by all worker-agent identifiers.
pub const AGENT_ID_PREFIX: &str = "agent-";

/// Generate a fresh agent id: `agent-<8 hex>`.
pub fn generate_agent_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("{AGENT_ID_PREFIX}{}", &raw[..8])
}

/// Whether a string matches the `agent-<8 lowercase hex>` pattern.
pub fn is_valid_agent_id(candidate: &str) -> bool {
    match candidate.strip_prefix(AGENT_ID_PREFIX) {
        Some(suffix) => {
            suffix.len() == 8
                && suffix
                    .chars()
                    .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        for _ in 0..32 {
            let id = generate_agent_id();
            assert!(is_valid_agent_id(&id), "invalid id generated: {id}");
        }
    }

    #[test]
    fn generated_ids_are_unique() {
        let a = generate_agent_id();
        let b = generate_agent_id();
        assert_ne!(a, b);
    }

    #[test]
    fn validation_rejects_malformed_ids() {
        assert!(!is_valid_agent_id("agent-"));
        assert!(!is_valid_agent_id("agent-XYZ12345"));
        assert!(!is_valid_agent_id("agent-0A1B2C3D"));
        assert!(!is_valid_agent_id("worker-0a1b2c3d"));
        assert!(!is_valid_agent_id("agent-0a1b2c3d4"));
        assert!(is_valid_agent_id("agent-0a1b2c3d"));
    }
}
