#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("file with 0 length is useless")]
    ZeroLength,
    #[error("block length can't be 0")]
    ZeroBlockLength,
    #[error("block length {block} should be <= piece length {piece}")]
    BlockLargerThanPiece { block: u32, piece: u32 },
    #[error("file of {0} bytes has more pieces than can be indexed")]
    TooManyPieces(u64),
    #[error("invalid piece index {0}")]
    InvalidPieceIndex(u32),
    #[error("expected a hex string of length {expected}, got {actual}")]
    BadHashLength { expected: usize, actual: usize },
    #[error("invalid hex in hash: {0}")]
    BadHashHex(#[from] hex::FromHexError),
}
