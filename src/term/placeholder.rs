//! Unicode placeholder grid rendering.
//!
//! A placeholder cell is U+10EEEE combined with up to three combining
//! marks: row, column, and the fourth byte of the image id. The terminal
//! recovers the id from the cell's foreground colour plus the third mark
//! and paints the corresponding region of the transmitted image.

use crate::id::space::{CellColour, IdSpace};
use crate::utils::{IkupError, Result};
use std::str::FromStr;

pub const PLACEHOLDER_CHAR: char = '\u{10EEEE}';

/// Combining marks encoding 0-based rows and columns (and the fourth id
/// byte). The protocol fixes this table; index = encoded value.
pub const ROW_COLUMN_DIACRITICS: [char; 297] = [
    '\u{305}', '\u{30d}', '\u{30e}', '\u{310}', '\u{312}', '\u{33d}',
    '\u{33e}', '\u{33f}', '\u{346}', '\u{34a}', '\u{34b}', '\u{34c}',
    '\u{350}', '\u{351}', '\u{352}', '\u{357}', '\u{35b}', '\u{363}',
    '\u{364}', '\u{365}', '\u{366}', '\u{367}', '\u{368}', '\u{369}',
    '\u{36a}', '\u{36b}', '\u{36c}', '\u{36d}', '\u{36e}', '\u{36f}',
    '\u{483}', '\u{484}', '\u{485}', '\u{486}', '\u{487}', '\u{592}',
    '\u{593}', '\u{594}', '\u{595}', '\u{597}', '\u{598}', '\u{599}',
    '\u{59c}', '\u{59d}', '\u{59e}', '\u{59f}', '\u{5a0}', '\u{5a1}',
    '\u{5a8}', '\u{5a9}', '\u{5ab}', '\u{5ac}', '\u{5af}', '\u{5c4}',
    '\u{610}', '\u{611}', '\u{612}', '\u{613}', '\u{614}', '\u{615}',
    '\u{616}', '\u{617}', '\u{657}', '\u{658}', '\u{659}', '\u{65a}',
    '\u{65b}', '\u{65d}', '\u{65e}', '\u{6d6}', '\u{6d7}', '\u{6d8}',
    '\u{6d9}', '\u{6da}', '\u{6db}', '\u{6dc}', '\u{6df}', '\u{6e0}',
    '\u{6e1}', '\u{6e2}', '\u{6e4}', '\u{6e7}', '\u{6e8}', '\u{6eb}',
    '\u{6ec}', '\u{730}', '\u{732}', '\u{733}', '\u{735}', '\u{736}',
    '\u{73a}', '\u{73d}', '\u{73f}', '\u{740}', '\u{741}', '\u{743}',
    '\u{745}', '\u{747}', '\u{749}', '\u{74a}', '\u{7eb}', '\u{7ec}',
    '\u{7ed}', '\u{7ee}', '\u{7ef}', '\u{7f0}', '\u{7f1}', '\u{7f3}',
    '\u{816}', '\u{817}', '\u{818}', '\u{819}', '\u{81b}', '\u{81c}',
    '\u{81d}', '\u{81e}', '\u{81f}', '\u{820}', '\u{821}', '\u{822}',
    '\u{823}', '\u{825}', '\u{826}', '\u{827}', '\u{829}', '\u{82a}',
    '\u{82b}', '\u{82c}', '\u{82d}', '\u{951}', '\u{953}', '\u{954}',
    '\u{f82}', '\u{f83}', '\u{f86}', '\u{f87}', '\u{135d}', '\u{135e}',
    '\u{135f}', '\u{17dd}', '\u{193a}', '\u{1a17}', '\u{1a75}', '\u{1a76}',
    '\u{1a77}', '\u{1a78}', '\u{1a79}', '\u{1a7a}', '\u{1a7b}', '\u{1a7c}',
    '\u{1b6b}', '\u{1b6d}', '\u{1b6e}', '\u{1b6f}', '\u{1b70}', '\u{1b71}',
    '\u{1b72}', '\u{1b73}', '\u{1cd0}', '\u{1cd1}', '\u{1cd2}', '\u{1cda}',
    '\u{1cdb}', '\u{1ce0}', '\u{1dc0}', '\u{1dc1}', '\u{1dc3}', '\u{1dc4}',
    '\u{1dc5}', '\u{1dc6}', '\u{1dc7}', '\u{1dc8}', '\u{1dc9}', '\u{1dcb}',
    '\u{1dcc}', '\u{1dd1}', '\u{1dd2}', '\u{1dd3}', '\u{1dd4}', '\u{1dd5}',
    '\u{1dd6}', '\u{1dd7}', '\u{1dd8}', '\u{1dd9}', '\u{1dda}', '\u{1ddb}',
    '\u{1ddc}', '\u{1ddd}', '\u{1dde}', '\u{1ddf}', '\u{1de0}', '\u{1de1}',
    '\u{1de2}', '\u{1de3}', '\u{1de4}', '\u{1de5}', '\u{1de6}', '\u{1dfe}',
    '\u{20d0}', '\u{20d1}', '\u{20d4}', '\u{20d5}', '\u{20d6}', '\u{20d7}',
    '\u{20db}', '\u{20dc}', '\u{20e1}', '\u{20e7}', '\u{20e9}', '\u{20f0}',
    '\u{2cef}', '\u{2cf0}', '\u{2cf1}', '\u{2de0}', '\u{2de1}', '\u{2de2}',
    '\u{2de3}', '\u{2de4}', '\u{2de5}', '\u{2de6}', '\u{2de7}', '\u{2de8}',
    '\u{2de9}', '\u{2dea}', '\u{2deb}', '\u{2dec}', '\u{2ded}', '\u{2dee}',
    '\u{2def}', '\u{2df0}', '\u{2df1}', '\u{2df2}', '\u{2df3}', '\u{2df4}',
    '\u{2df5}', '\u{2df6}', '\u{2df7}', '\u{2df8}', '\u{2df9}', '\u{2dfa}',
    '\u{2dfb}', '\u{2dfc}', '\u{2dfd}', '\u{2dfe}', '\u{2dff}', '\u{a66f}',
    '\u{a67c}', '\u{a67d}', '\u{a6f0}', '\u{a6f1}', '\u{a8e0}', '\u{a8e1}',
    '\u{a8e2}', '\u{a8e3}', '\u{a8e4}', '\u{a8e5}', '\u{a8e6}', '\u{a8e7}',
    '\u{a8e8}', '\u{a8e9}', '\u{a8ea}', '\u{a8eb}', '\u{a8ec}', '\u{a8ed}',
    '\u{a8ee}', '\u{a8ef}', '\u{a8f0}', '\u{a8f1}', '\u{aab0}', '\u{aab2}',
    '\u{aab3}', '\u{aab7}', '\u{aab8}', '\u{aabe}', '\u{aabf}', '\u{aac1}',
    '\u{fe20}', '\u{fe21}', '\u{fe22}', '\u{fe23}', '\u{fe24}', '\u{fe25}',
    '\u{fe26}', '\u{10a0f}', '\u{10a38}', '\u{1d185}', '\u{1d186}', '\u{1d187}',
    '\u{1d188}', '\u{1d189}', '\u{1d1aa}', '\u{1d1ab}', '\u{1d1ac}', '\u{1d1ad}',
    '\u{1d242}', '\u{1d243}', '\u{1d244}',
];

/// What to do with the cursor around the rendered grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreCursor {
    True,
    False,
    /// True iff an explicit position was given.
    #[default]
    Auto,
}

impl FromStr for RestoreCursor {
    type Err = IkupError;

    fn from_str(s: &str) -> Result<RestoreCursor> {
        match s {
            "true" => Ok(RestoreCursor::True),
            "false" => Ok(RestoreCursor::False),
            "auto" => Ok(RestoreCursor::Auto),
            other => Err(IkupError::invalid_arg(format!(
                "invalid --restore-cursor value '{}', expected true, false or auto",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlaceholderOptions {
    /// Move between rows with literal line feeds instead of cursor
    /// commands (for non-tty output).
    pub use_line_feeds: bool,
    pub restore_cursor: RestoreCursor,
    /// Absolute cell position of the top-left corner, 0-based (col, row).
    pub position: Option<(u32, u32)>,
}

/// Render the placeholder grid for `id` as a terminal byte sequence.
pub fn render(id: u32, space: IdSpace, cols: u32, rows: u32, opts: &PlaceholderOptions) -> Result<Vec<u8>> {
    if id == 0 {
        return Err(IkupError::invalid_arg("image id cannot be zero"));
    }
    if cols == 0 || rows == 0 {
        return Err(IkupError::invalid_arg("placeholder box must be non-empty"));
    }
    if opts.position.is_some() && opts.use_line_feeds {
        return Err(IkupError::invalid_arg(
            "line feeds cannot be combined with an absolute position",
        ));
    }
    let (colour, diacritic4) = space.cell_colour(id);
    let mut prelude = Vec::new();
    match colour {
        CellColour::Indexed(index) => {
            prelude.extend_from_slice(format!("\x1b[38;5;{}m", index).as_bytes())
        }
        CellColour::Rgb(r, g, b) => {
            prelude.extend_from_slice(format!("\x1b[38;2;{};{};{}m", r, g, b).as_bytes())
        }
    }
    let fourth_mark = diacritic4.map(|b| ROW_COLUMN_DIACRITICS[b as usize]);

    let restore = match opts.restore_cursor {
        RestoreCursor::True => true,
        RestoreCursor::False => false,
        RestoreCursor::Auto => opts.position.is_some(),
    };

    let mut out = Vec::new();
    if restore {
        out.extend_from_slice(b"\x1b[s");
    }
    let mut cell = String::new();
    for row in 0..rows {
        if let Some((x, y)) = opts.position {
            out.extend_from_slice(format!("\x1b[{};{}H", y + row + 1, x + 1).as_bytes());
        }
        // Reset before and after every row so the id colours never bleed
        // into surrounding text.
        out.extend_from_slice(b"\x1b[0m");
        if row as usize >= ROW_COLUMN_DIACRITICS.len() {
            for _ in 0..cols {
                out.push(b' ');
            }
        } else {
            out.extend_from_slice(&prelude);
            let row_mark = ROW_COLUMN_DIACRITICS[row as usize];
            for col in 0..cols {
                cell.clear();
                cell.push(PLACEHOLDER_CHAR);
                cell.push(row_mark);
                if (col as usize) < ROW_COLUMN_DIACRITICS.len() {
                    cell.push(ROW_COLUMN_DIACRITICS[col as usize]);
                    if let Some(mark) = fourth_mark {
                        cell.push(mark);
                    }
                }
                out.extend_from_slice(cell.as_bytes());
            }
        }
        out.extend_from_slice(b"\x1b[0m");
        let last = row + 1 == rows;
        if opts.position.is_none() {
            if opts.use_line_feeds {
                out.push(b'\n');
            } else if !last {
                // Cursor down (scrolling if needed), then back to the
                // starting column.
                out.extend_from_slice(b"\x1bD");
                out.extend_from_slice(format!("\x1b[{}D", cols).as_bytes());
            } else if !restore {
                out.extend_from_slice(format!("\x1b[{}D", cols).as_bytes());
                out.extend_from_slice(b"\x1bD");
            }
        }
    }
    if restore {
        out.extend_from_slice(b"\x1b[u");
    }
    Ok(out)
}
