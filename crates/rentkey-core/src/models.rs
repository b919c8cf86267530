//! Data models exchanged with the authentication endpoints.

use serde::{Deserialize, Serialize};

/// The signed-in user, as reported by the user-info endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct UserInfo {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

impl UserInfo {
    /// Name for display, falling back to the email address
    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(&self.email)
    }
}

/// Registration form submitted to the register endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_user_info() {
        let json = r#"{"id":"u-17","email":"pat@example.com","name":"Pat Lee","role":"tenant","unitId":4}"#;
        let user: UserInfo = serde_json::from_str(json).expect("Failed to parse user info JSON");
        assert_eq!(user.id, "u-17");
        assert_eq!(user.role.as_deref(), Some("tenant"));
        assert_eq!(user.display_name(), "Pat Lee");
    }

    #[test]
    fn test_display_name_falls_back_to_email() {
        let user: UserInfo = serde_json::from_str(r#"{"id":"1","email":"a@b.c","name":"  "}"#).unwrap();
        assert_eq!(user.display_name(), "a@b.c");

        let user: UserInfo = serde_json::from_str(r#"{"id":"1","email":"a@b.c"}"#).unwrap();
        assert_eq!(user.name, None);
        assert_eq!(user.display_name(), "a@b.c");
    }
}
