use serde::{Deserialize, Serialize};

macro_rules! id_type {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

id_type!(ConversationId);
id_type!(MessageId);
id_type!(WorkspaceId);

/// The authenticated caller: user plus the workspace the session is bound to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub workspace_id: WorkspaceId,
}

/// Conversation sharing state. `Shared` makes the conversation readable
/// through its share link; the pipeline itself never changes this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Private,
    Shared,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Shared => "shared",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "shared" => Visibility::Shared,
            _ => Visibility::Private,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_types_are_distinct_and_serializable() {
        let conv = ConversationId::new();
        let msg = MessageId::from("m-1");

        assert!(!conv.as_str().is_empty());
        assert_eq!(serde_json::to_string(&msg).unwrap(), "\"m-1\"");
    }

    #[test]
    fn visibility_round_trip() {
        assert_eq!(Visibility::parse("shared"), Visibility::Shared);
        assert_eq!(Visibility::parse("private"), Visibility::Private);
        assert_eq!(Visibility::parse("garbage"), Visibility::Private);
        assert_eq!(Visibility::Shared.as_str(), "shared");
    }
}
