use std::ops::Range;

use serde::{Deserialize, Serialize};

use crate::{
    Error,
    constants::{BLOCK_SIZE, PIECE_SIZE},
};

pub const fn ceil_div_u64(a: u64, b: u64) -> u64 {
    a.div_ceil(b)
}

pub const fn last_element_size_u64(total: u64, element_size: u64) -> u64 {
    let rem = total % element_size;
    if rem == 0 {
        return element_size;
    }
    rem
}

/// A block inside a piece. Blocks are numbered from 0 inside each piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PieceBlock {
    pub piece_index: u32,
    pub block_index: u32,
}

impl PieceBlock {
    pub const fn new(piece_index: u32, block_index: u32) -> Self {
        Self {
            piece_index,
            block_index,
        }
    }
}

impl std::fmt::Display for PieceBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.piece_index, self.block_index)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    pub block: PieceBlock,
    pub size: u32,
    /// Offset of the block from the start of its piece.
    pub offset: u32,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValidPieceIndex(u32);

impl std::fmt::Display for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::fmt::Debug for ValidPieceIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl ValidPieceIndex {
    pub fn get(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lengths {
    block_length: u32,
    total_length: u64,
    piece_length: u32,
    last_piece_id: u32,
    last_piece_length: u32,
    max_blocks_per_piece: u32,
}

impl Lengths {
    /// Lengths of a file using the protocol piece and block sizes.
    pub fn for_file_size(total_length: u64) -> Result<Self, Error> {
        Self::new(total_length, PIECE_SIZE, BLOCK_SIZE)
    }

    pub fn new(total_length: u64, piece_length: u32, block_length: u32) -> Result<Self, Error> {
        if block_length == 0 {
            return Err(Error::ZeroBlockLength);
        }
        if block_length > piece_length {
            return Err(Error::BlockLargerThanPiece {
                block: block_length,
                piece: piece_length,
            });
        }
        if total_length == 0 {
            return Err(Error::ZeroLength);
        }
        let total_pieces = ceil_div_u64(total_length, piece_length as u64);
        let total_pieces: u32 = total_pieces
            .try_into()
            .map_err(|_| Error::TooManyPieces(total_length))?;
        Ok(Self {
            block_length,
            piece_length,
            total_length,
            max_blocks_per_piece: ceil_div_u64(piece_length as u64, block_length as u64) as u32,
            last_piece_id: total_pieces - 1,
            last_piece_length: last_element_size_u64(total_length, piece_length as u64) as u32,
        })
    }

    pub const fn piece_bitfield_bytes(&self) -> usize {
        ceil_div_u64(self.total_pieces() as u64, 8) as usize
    }
    pub const fn total_length(&self) -> u64 {
        self.total_length
    }
    pub const fn validate_piece_index(&self, index: u32) -> Option<ValidPieceIndex> {
        if index > self.last_piece_id {
            return None;
        }
        Some(ValidPieceIndex(index))
    }
    pub const fn default_piece_length(&self) -> u32 {
        self.piece_length
    }
    pub const fn default_block_length(&self) -> u32 {
        self.block_length
    }
    pub const fn max_blocks_per_piece(&self) -> u32 {
        self.max_blocks_per_piece
    }
    pub const fn last_piece_id(&self) -> ValidPieceIndex {
        ValidPieceIndex(self.last_piece_id)
    }
    pub const fn total_pieces(&self) -> u32 {
        self.last_piece_id + 1
    }
    pub const fn piece_length(&self, index: ValidPieceIndex) -> u32 {
        if index.0 == self.last_piece_id {
            return self.last_piece_length;
        }
        self.piece_length
    }
    pub const fn piece_offset(&self, index: ValidPieceIndex) -> u64 {
        index.0 as u64 * self.piece_length as u64
    }
    pub const fn piece_range(&self, index: ValidPieceIndex) -> Range<u64> {
        let start = self.piece_offset(index);
        start..start + self.piece_length(index) as u64
    }
    pub const fn blocks_in_piece(&self, index: ValidPieceIndex) -> u32 {
        ceil_div_u64(self.piece_length(index) as u64, self.block_length as u64) as u32
    }

    pub fn block_size(&self, block: PieceBlock) -> Option<u32> {
        let piece = self.validate_piece_index(block.piece_index)?;
        if block.block_index >= self.blocks_in_piece(piece) {
            return None;
        }
        let offset = block.block_index * self.block_length;
        Some(std::cmp::min(
            self.block_length,
            self.piece_length(piece) - offset,
        ))
    }

    pub fn block_info(&self, block: PieceBlock) -> Option<BlockInfo> {
        let size = self.block_size(block)?;
        Some(BlockInfo {
            block,
            size,
            offset: block.block_index * self.block_length,
        })
    }

    /// Absolute byte range of the block within the file:
    /// `piece_index * piece_size + offset`.
    pub fn block_absolute_range(&self, block: PieceBlock) -> Option<Range<u64>> {
        let info = self.block_info(block)?;
        let start = block.piece_index as u64 * self.piece_length as u64 + info.offset as u64;
        Some(start..start + info.size as u64)
    }

    /// Maps an absolute file offset to the block containing it and the
    /// offset inside that block.
    pub fn locate(&self, absolute_offset: u64) -> Option<(PieceBlock, u32)> {
        if absolute_offset >= self.total_length {
            return None;
        }
        let piece_index = (absolute_offset / self.piece_length as u64) as u32;
        let in_piece = (absolute_offset % self.piece_length as u64) as u32;
        let block_index = in_piece / self.block_length;
        Some((
            PieceBlock::new(piece_index, block_index),
            in_piece % self.block_length,
        ))
    }

    pub fn iter_piece_indices(&self) -> impl Iterator<Item = ValidPieceIndex> + use<> {
        (0..self.total_pieces()).map(ValidPieceIndex)
    }

    pub fn iter_block_infos(&self, index: ValidPieceIndex) -> impl Iterator<Item = BlockInfo> + use<> {
        let mut remaining = self.piece_length(index);
        let block_size = self.block_length;
        (0u32..).scan(0, move |offset, idx| {
            if remaining == 0 {
                return None;
            }
            let s = std::cmp::min(remaining, block_size);
            let result = BlockInfo {
                block: PieceBlock::new(index.0, idx),
                size: s,
                offset: *offset,
            };
            *offset += s;
            remaining -= s;
            Some(result)
        })
    }
}
