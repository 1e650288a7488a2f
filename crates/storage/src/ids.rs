use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// Macro keeps all ID wrappers structurally identical, so the two id spaces cannot drift.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub const fn new(raw: u64) -> Self {
                Self(raw)
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = raw.trim().parse::<u64>().context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub const fn as_u64(&self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(MessageId, "message-id");
define_storage_id!(QueryId, "query-id");

/// A query id is the id of the assistant message whose stream produced the result.
impl From<MessageId> for QueryId {
    fn from(value: MessageId) -> Self {
        Self(value.0)
    }
}

impl From<QueryId> for MessageId {
    fn from(value: QueryId) -> Self {
        Self(value.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_decimal_ids_and_rejects_garbage() {
        assert_eq!(MessageId::parse(" 42 ").unwrap(), MessageId::new(42));
        assert_eq!("7".parse::<QueryId>().unwrap(), QueryId::new(7));

        let error = QueryId::parse("seven").unwrap_err();
        assert!(matches!(
            error,
            StorageError::InvalidId {
                id_type: "query-id",
                ..
            }
        ));
    }

    #[test]
    fn query_id_mirrors_message_id() {
        let message_id = MessageId::new(11);
        let query_id = QueryId::from(message_id);
        assert_eq!(query_id.as_u64(), 11);
        assert_eq!(MessageId::from(query_id), message_id);
    }
}
