use serde::{Deserialize, Serialize};

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// No `hello` yet. May only read settings, services and slots.
    Anonymous,
    Client { user_id: String },
    Operator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Operator,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    BadToken,
    MissingUserId,
}

/// Operator token check. Clients are identified, not authenticated: end-user
/// authentication happens before traffic reaches this service.
pub struct Authenticator {
    operator_token: String,
}

impl Authenticator {
    pub fn new(operator_token: String) -> Self {
        Self { operator_token }
    }

    pub fn hello(
        &self,
        role: Role,
        user_id: Option<String>,
        token: Option<&str>,
    ) -> Result<Identity, AuthError> {
        match role {
            Role::Operator => {
                let presented = token.unwrap_or_default().as_bytes();
                if constant_time_eq(presented, self.operator_token.as_bytes()) {
                    Ok(Identity::Operator)
                } else {
                    Err(AuthError::BadToken)
                }
            }
            Role::Client => match user_id {
                Some(user_id) if !user_id.is_empty() => Ok(Identity::Client { user_id }),
                _ => Err(AuthError::MissingUserId),
            },
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

impl Identity {
    pub fn is_operator(&self) -> bool {
        matches!(self, Identity::Operator)
    }

    /// Operators see everything; clients only their own documents.
    pub fn may_access(&self, owner: &str) -> bool {
        match self {
            Identity::Operator => true,
            Identity::Client { user_id } => user_id == owner,
            Identity::Anonymous => false,
        }
    }
}
