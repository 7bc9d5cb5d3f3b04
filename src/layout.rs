//! Error-term layout.
//!
//! Given an error-term type and the measurement dimensions, the layout is a
//! pure arithmetic map from named blocks to (offset, rows, columns) views
//! within the flat per-frequency error-term vector. The solver and the
//! applier address terms exclusively through it.

use crate::error::CalibrationError;

/// The supported error-term formulations.
///
/// The T family relates raw measurements `M` to the standard's S-matrix via
/// `M (Tx S + Tm) = Ts S + Ti`; the U family is its dual
/// `Us M + Ui = S (Ux M + Um)`. The 8-term variants use diagonal blocks, the
/// 16-term variants full blocks; the 10-term variants add off-diagonal
/// leakage on top of the 8-term model. UE14 solves one seven-term U system
/// per driven column and E12 is the classical per-column
/// directivity/tracking/match formulation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalType {
    T8,
    U8,
    TE10,
    UE10,
    T16,
    U16,
    UE14,
    E12,
}

impl CalType {
    pub fn name(&self) -> &'static str {
        match self {
            CalType::T8 => "T8",
            CalType::U8 => "U8",
            CalType::TE10 => "TE10",
            CalType::UE10 => "UE10",
            CalType::T16 => "T16",
            CalType::U16 => "U16",
            CalType::UE14 => "UE14",
            CalType::E12 => "E12",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "T8" => Some(CalType::T8),
            "U8" => Some(CalType::U8),
            "TE10" => Some(CalType::TE10),
            "UE10" => Some(CalType::UE10),
            "T16" => Some(CalType::T16),
            "U16" => Some(CalType::U16),
            "UE14" => Some(CalType::UE14),
            "E12" => Some(CalType::E12),
        _ => None,
        }
    }

    /// Whether the formulation is in the T (rather than U) family.
    pub fn t_family(&self) -> bool {
        matches!(self, CalType::T8 | CalType::TE10 | CalType::T16)
    }

    /// Whether the four transfer blocks are full matrices instead of
    /// diagonals.
    pub fn full_blocks(&self) -> bool {
        matches!(self, CalType::T16 | CalType::U16)
    }

    /// Whether the layout carries a separate off-diagonal leakage block.
    pub fn has_leakage_block(&self) -> bool {
        matches!(self, CalType::TE10 | CalType::UE10 | CalType::UE14)
    }

    /// Whether leakage is representable at all (E12 folds it into `el`).
    pub fn handles_leakage(&self) -> bool {
        self.has_leakage_block() || matches!(self, CalType::E12 | CalType::T16 | CalType::U16)
    }

    /// Whether the error terms are organised as independent per-column
    /// systems.
    pub fn per_column(&self) -> bool {
        matches!(self, CalType::UE14 | CalType::E12)
    }
}

impl std::fmt::Display for CalType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Named error-term blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Ts,
    Ti,
    Tx,
    Tm,
    Us,
    Ui,
    Ux,
    Um,
    /// Off-diagonal leakage, or for E12 the per-column directivity/leakage.
    El,
    /// E12 tracking.
    Er,
    /// E12 port match.
    Em,
}

impl BlockKind {
    pub fn name(&self) -> &'static str {
        match self {
            BlockKind::Ts => "ts",
            BlockKind::Ti => "ti",
            BlockKind::Tx => "tx",
            BlockKind::Tm => "tm",
            BlockKind::Us => "us",
            BlockKind::Ui => "ui",
            BlockKind::Ux => "ux",
            BlockKind::Um => "um",
            BlockKind::El => "el",
            BlockKind::Er => "er",
            BlockKind::Em => "em",
        }
    }
}

/// View descriptor of one block inside the flat per-frequency term vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockDescriptor {
    pub kind: BlockKind,
    /// Driven column for per-column layouts, `None` otherwise.
    pub column: Option<usize>,
    pub offset: usize,
    pub rows: usize,
    pub columns: usize,
    /// Whether only the diagonal is stored (`rows` entries).
    pub diagonal: bool,
    /// Whether the diagonal is absent (off-diagonal leakage storage).
    pub off_diagonal: bool,
}

impl BlockDescriptor {
    /// Number of terms stored for this block.
    pub fn len(&self) -> usize {
        if self.diagonal {
            self.rows
        } else if self.off_diagonal {
            self.rows * self.columns - self.rows.min(self.columns)
        } else {
            self.rows * self.columns
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat index of cell `(i, j)`; `None` for an absent diagonal cell of an
    /// off-diagonal block or for off-diagonal cells of a diagonal block.
    pub fn term_index(&self, i: usize, j: usize) -> Option<usize> {
        if self.diagonal {
            return (i == j).then_some(self.offset + i);
        }
        if self.off_diagonal {
            if i == j {
                return None;
            }
            // Row-major with the diagonal cells skipped.
            let before = i * self.columns + j;
            let skipped = (0..=i).filter(|&d| d < self.columns && (d < i || d < j)).count();
            return Some(self.offset + before - skipped);
        }
        Some(self.offset + i * self.columns + j)
    }
}

/// Error-term layout for one (type, rows, columns) combination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    ctype: CalType,
    rows: usize,
    columns: usize,
    blocks: Vec<BlockDescriptor>,
    terms: usize,
}

impl Layout {
    /// Compute the layout.
    ///
    /// # Arguments
    ///
    /// * `ctype`: The error-term formulation.
    /// * `rows`: Measurement rows (ports observed by the instrument).
    /// * `columns`: Measurement columns (ports driven by the instrument).
    ///
    /// returns: `Result<Layout, CalibrationError>`
    pub fn new(ctype: CalType, rows: usize, columns: usize) -> Result<Self, CalibrationError> {
        if rows == 0 || columns == 0 {
            return Err(CalibrationError::EmptyDimensions);
        }
        if rows != columns {
            return Err(CalibrationError::NotSquare(ctype.name().to_string(), rows, columns));
        }
        let n = rows;
        let mut blocks = vec![];
        let mut offset = 0;
        let mut push = |kind, column, block_rows, block_columns, diagonal, off_diagonal, offset: &mut usize| {
            let descriptor = BlockDescriptor {
                kind,
                column,
                offset: *offset,
                rows: block_rows,
                columns: block_columns,
                diagonal,
                off_diagonal,
            };
            *offset += descriptor.len();
            blocks.push(descriptor);
        };

        match ctype {
            CalType::T8 | CalType::TE10 | CalType::T16 => {
                let diagonal = !ctype.full_blocks();
                for kind in [BlockKind::Ts, BlockKind::Ti, BlockKind::Tx, BlockKind::Tm] {
                    push(kind, None, n, n, diagonal, false, &mut offset);
                }
                if ctype.has_leakage_block() {
                    push(BlockKind::El, None, n, n, false, true, &mut offset);
                }
            }
            CalType::U8 | CalType::UE10 | CalType::U16 => {
                let diagonal = !ctype.full_blocks();
                for kind in [BlockKind::Us, BlockKind::Ui, BlockKind::Ux, BlockKind::Um] {
                    push(kind, None, n, n, diagonal, false, &mut offset);
                }
                if ctype.has_leakage_block() {
                    push(BlockKind::El, None, n, n, false, true, &mut offset);
                }
            }
            CalType::UE14 => {
                for column in 0..n {
                    push(BlockKind::Us, Some(column), n, n, true, false, &mut offset);
                    push(BlockKind::Ui, Some(column), n, 1, false, false, &mut offset);
                    push(BlockKind::Ux, Some(column), n, n, true, false, &mut offset);
                    push(BlockKind::Um, Some(column), 1, 1, false, false, &mut offset);
                }
                push(BlockKind::El, None, n, n, false, true, &mut offset);
            }
            CalType::E12 => {
                for column in 0..n {
                    push(BlockKind::El, Some(column), n, 1, false, false, &mut offset);
                    push(BlockKind::Er, Some(column), n, 1, false, false, &mut offset);
                    push(BlockKind::Em, Some(column), n, 1, false, false, &mut offset);
                }
            }
        }

        Ok(Self {
            ctype,
            rows,
            columns,
            blocks,
            terms: offset,
        })
    }

    pub fn cal_type(&self) -> CalType {
        self.ctype
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    /// Total error terms stored per frequency.
    pub fn terms_per_frequency(&self) -> usize {
        self.terms
    }

    pub fn blocks(&self) -> &[BlockDescriptor] {
        &self.blocks
    }

    /// Look up a block, by driven column for per-column layouts.
    pub fn block(&self, kind: BlockKind, column: Option<usize>) -> Option<&BlockDescriptor> {
        self.blocks.iter().find(|b| b.kind == kind && b.column == column)
    }
}
