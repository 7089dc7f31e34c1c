use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElectionError {
    #[error("Unknown fault type: {0}")]
    UnknownFault(String),

    #[error("Invalid election config: {0}")]
    InvalidConfig(String),

    #[error("Cluster has no configured hosts")]
    EmptyCluster,

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),

    #[error("Servers {first} and {second} both map to id {id}")]
    DuplicateServerId {
        id: u64,
        first: String,
        second: String,
    },

    #[error("An election round is already in progress")]
    RoundInProgress,
}
