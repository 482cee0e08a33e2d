//! Cell-box geometry: fitting pixel dimensions into a terminal cell grid.

use crate::utils::{IkupError, Result};

/// Parse a "WxH" size string into a pair of positive integers.
pub fn parse_size(value: &str) -> Result<(u32, u32)> {
    let (w, h) = value
        .split_once('x')
        .ok_or_else(|| IkupError::invalid_arg(format!("size must be WxH: '{}'", value)))?;
    let width: u32 = w
        .trim()
        .parse()
        .map_err(|_| IkupError::invalid_arg(format!("size must be integer: '{}'", value)))?;
    let height: u32 = h
        .trim()
        .parse()
        .map_err(|_| IkupError::invalid_arg(format!("size must be integer: '{}'", value)))?;
    if width < 1 || height < 1 {
        return Err(IkupError::invalid_arg(format!(
            "size must be positive: '{}'",
            value
        )));
    }
    Ok((width, height))
}

/// Limits and scaling applied when computing a cell box.
#[derive(Debug, Clone, Copy)]
pub struct BoxConstraints {
    pub cols: Option<u32>,
    pub rows: Option<u32>,
    pub max_cols: u32,
    pub max_rows: u32,
    /// Cell size in pixels, (width, height).
    pub cell_size: (u32, u32),
    pub scale: f64,
}

/// Compute the cell box for an image of `width` x `height` pixels.
///
/// When only one of cols/rows is given the other follows the aspect ratio;
/// when neither is given both are derived from the cell size. Automatically
/// computed dimensions are clamped to the maxima while preserving aspect.
/// Rows never exceed 256 (the diacritic table limit).
pub fn fit_cell_box(width: u32, height: u32, constraints: &BoxConstraints) -> Result<(u32, u32)> {
    if let (Some(cols), Some(rows)) = (constraints.cols, constraints.rows) {
        return Ok((cols.max(1), rows.clamp(1, 256)));
    }
    if width == 0 || height == 0 {
        return Err(IkupError::invalid_arg("image has zero pixel dimensions"));
    }
    let max_cols = constraints.max_cols.max(1);
    let max_rows = constraints.max_rows.clamp(1, 256);
    let (cell_w, cell_h) = constraints.cell_size;
    let (cell_w, cell_h) = (cell_w.max(1) as f64, cell_h.max(1) as f64);
    let width = width as f64 * constraints.scale;
    let height = height as f64 * constraints.scale;

    let cols_to_rows = |cols: f64| (cols * cell_w * height / (width * cell_h)).ceil();
    let rows_to_cols = |rows: f64| (rows * cell_h * width / (height * cell_w)).ceil();

    let (mut cols, mut rows, cols_auto, rows_auto) = match (constraints.cols, constraints.rows) {
        (Some(c), None) => (c as f64, cols_to_rows(c as f64), false, true),
        (None, Some(r)) => (rows_to_cols(r as f64), r as f64, true, false),
        _ => (
            (width / cell_w).ceil(),
            (height / cell_h).ceil(),
            true,
            true,
        ),
    };

    // Shrink automatically computed dimensions back under the caps,
    // recomputing the other axis to keep the aspect ratio.
    if cols_auto && cols > max_cols as f64 {
        cols = max_cols as f64;
        if rows_auto {
            rows = cols_to_rows(cols);
        }
    }
    if rows_auto && rows > max_rows as f64 {
        rows = max_rows as f64;
        if cols_auto {
            cols = rows_to_cols(rows);
        }
    }
    let cols = (cols as u32).clamp(1, max_cols);
    let rows = (rows as u32).clamp(1, max_rows);
    Ok((cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constraints() -> BoxConstraints {
        BoxConstraints {
            cols: None,
            rows: None,
            max_cols: 80,
            max_rows: 24,
            cell_size: (8, 16),
            scale: 1.0,
        }
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("8x16").unwrap(), (8, 16));
        assert!(parse_size("8").is_err());
        assert!(parse_size("0x16").is_err());
        assert!(parse_size("axb").is_err());
    }

    #[test]
    fn test_explicit_box_wins() {
        let mut c = constraints();
        c.cols = Some(10);
        c.rows = Some(3);
        assert_eq!(fit_cell_box(640, 480, &c).unwrap(), (10, 3));
    }

    #[test]
    fn test_rows_only_preserves_aspect() {
        // A square image in 8x16 cells: rows=2 means 32px tall, so 32px
        // wide = 4 columns.
        let mut c = constraints();
        c.rows = Some(2);
        assert_eq!(fit_cell_box(100, 100, &c).unwrap(), (4, 2));
    }

    #[test]
    fn test_auto_fits_cell_grid() {
        let c = constraints();
        assert_eq!(fit_cell_box(80, 32, &c).unwrap(), (10, 2));
        // Ceil rounding.
        assert_eq!(fit_cell_box(81, 33, &c).unwrap(), (11, 3));
    }

    #[test]
    fn test_max_caps_preserve_aspect() {
        let mut c = constraints();
        c.max_cols = 3;
        c.max_rows = 4;
        let (cols, rows) = fit_cell_box(100, 100, &c).unwrap();
        assert!(cols <= 3 && rows <= 4);
        // A square image in 8x16 cells is twice as wide in cells; capping
        // cols to 3 leaves rows at the matching aspect value.
        assert_eq!((cols, rows), (3, 2));
    }

    #[test]
    fn test_scale() {
        let mut c = constraints();
        c.scale = 2.0;
        assert_eq!(fit_cell_box(80, 32, &c).unwrap(), (20, 4));
    }

    #[test]
    fn test_rows_capped_at_256() {
        let mut c = constraints();
        c.cols = Some(1);
        c.rows = Some(1000);
        assert_eq!(fit_cell_box(10, 10, &c).unwrap(), (1, 256));
    }
}
