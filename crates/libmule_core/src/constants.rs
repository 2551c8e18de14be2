/// Size of a piece: the unit of hash verification.
pub const PIECE_SIZE: u32 = 9_728_000;

/// Size of a block: the unit of a network request. It does not divide
/// [`PIECE_SIZE`], so the last block of every piece is shorter.
pub const BLOCK_SIZE: u32 = 184_320;

pub const BLOCKS_PER_PIECE: u32 = PIECE_SIZE.div_ceil(BLOCK_SIZE);

/// One "request parts" message carries at most this many byte ranges.
pub const MAX_RANGES_PER_REQUEST: usize = 3;
