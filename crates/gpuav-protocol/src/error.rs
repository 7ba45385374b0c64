#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("record truncated: need {needed} words, have {available}")]
    TruncatedRecord { needed: usize, available: usize },

    #[error("error output buffer too small: {0} words")]
    BufferTooSmall(usize),

    #[error("capacity {0} words does not fit the capacity field")]
    CapacityTooLarge(usize),

    #[error("malformed buffer dump: {0}")]
    MalformedDump(String),

    #[error(transparent)]
    Printf(#[from] PrintfError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PrintfError {
    #[error("conversion at byte {0} is not terminated")]
    UnterminatedConversion(usize),

    #[error("unsupported conversion '{0}'")]
    UnsupportedConversion(char),

    #[error("vector width {0} is outside 2..=4")]
    BadVectorWidth(u32),

    #[error("payload exhausted: value {value} needs {needed} more bytes, {available} left")]
    PayloadExhausted {
        value: usize,
        needed: usize,
        available: usize,
    },

    #[error("unknown format string {string_id} for shader {shader_id}")]
    UnknownFormat { shader_id: u32, string_id: u32 },
}
