//! Render adapter: the one place served windows meet the terminal.
//!
//! Everything here is pure formatting over a [`ViewFrame`]; no I/O and no
//! cache access, so the engine stays embeddable behind other frontends.

use std::borrow::Cow;

use polars::prelude::{AnyValue, Column};
use ratatui::layout::Constraint;
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::Line;
use ratatui::widgets::{Cell, Row, Table};

use crate::error::Result;
use crate::source::ORIGIN_COLUMN;
use crate::view::ViewFrame;

#[derive(Clone, Copy, Debug)]
pub struct RenderOptions {
    /// Show the origin row index as a leading column.
    pub row_numbers: bool,
    pub header_bg: Color,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            row_numbers: false,
            header_bg: Color::Blue,
        }
    }
}

fn cell_text<'a>(value: AnyValue<'a>) -> Cow<'a, str> {
    if matches!(value, AnyValue::Null) {
        Cow::Borrowed("")
    } else {
        value.str_value()
    }
}

/// Columns to display, in frame order. The origin index is bookkeeping and
/// is surfaced only as row numbers, never as a data column.
fn display_columns<'a>(frame: &'a ViewFrame) -> Vec<&'a Column> {
    frame
        .rows
        .get_columns()
        .iter()
        .filter(|c| c.name().as_str() != ORIGIN_COLUMN)
        .collect()
}

/// Header labels for the frame, including the row-number column when shown.
pub fn header_labels(frame: &ViewFrame, opts: &RenderOptions) -> Vec<String> {
    let mut labels = Vec::new();
    if opts.row_numbers {
        labels.push(String::new());
    }
    labels.extend(
        display_columns(frame)
            .iter()
            .map(|c| c.name().to_string()),
    );
    labels
}

/// Flatten the frame into display strings, one Vec per visible row. Kept
/// separate from widget construction so formatting is testable headless.
pub fn frame_cells(frame: &ViewFrame, opts: &RenderOptions) -> Result<Vec<Vec<String>>> {
    let columns = display_columns(frame);
    let origin = if opts.row_numbers {
        frame
            .rows
            .get_columns()
            .iter()
            .find(|c| c.name().as_str() == ORIGIN_COLUMN)
    } else {
        None
    };

    let mut out = Vec::with_capacity(frame.rows.height());
    for i in 0..frame.rows.height() {
        let mut row = Vec::with_capacity(columns.len() + 1);
        if opts.row_numbers {
            let label = match origin {
                Some(col) => cell_text(col.get(i)?).into_owned(),
                None => (frame.range.start + i).to_string(),
            };
            row.push(label);
        }
        for col in &columns {
            row.push(cell_text(col.get(i)?).into_owned());
        }
        out.push(row);
    }
    Ok(out)
}

/// Build the table widget for one served window.
pub fn frame_table<'a>(frame: &ViewFrame, opts: &RenderOptions) -> Result<Table<'a>> {
    let headers = header_labels(frame, opts);
    let cells = frame_cells(frame, opts)?;

    let mut widths: Vec<u16> = headers.iter().map(|h| h.chars().count() as u16).collect();
    for row in &cells {
        for (i, text) in row.iter().enumerate() {
            widths[i] = widths[i].max(text.chars().count() as u16);
        }
    }

    let rows: Vec<Row> = cells
        .into_iter()
        .map(|row| {
            Row::new(
                row.into_iter()
                    .map(|text| Cell::from(Line::from(text)))
                    .collect::<Vec<_>>(),
            )
        })
        .collect();

    let header_style = Style::default()
        .bg(opts.header_bg)
        .add_modifier(Modifier::BOLD);
    let constraints: Vec<Constraint> = widths.into_iter().map(Constraint::Length).collect();

    Ok(Table::new(rows, constraints)
        .column_spacing(1)
        .header(Row::new(headers).style(header_style))
        .row_highlight_style(Style::default().add_modifier(Modifier::REVERSED)))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use polars::df;
    use polars::prelude::*;

    use super::*;

    fn frame_for(df: DataFrame) -> ViewFrame {
        let height = df.height();
        ViewFrame {
            // Formatting never consults the schema; an empty one will do.
            schema: Arc::new(Schema::default()),
            rows: df,
            range: 0..height,
            total_rows: Some(height),
        }
    }

    #[test]
    fn origin_column_is_hidden_from_data_cells() {
        let df = df!(
            ORIGIN_COLUMN => [0u32, 1, 2],
            "name" => ["a", "b", "c"],
        )
        .unwrap();
        let frame = frame_for(df);

        let opts = RenderOptions::default();
        assert_eq!(header_labels(&frame, &opts), vec!["name"]);
        let cells = frame_cells(&frame, &opts).unwrap();
        assert_eq!(cells[1], vec!["b".to_string()]);
    }

    #[test]
    fn row_numbers_come_from_the_origin_index() {
        let df = df!(
            ORIGIN_COLUMN => [40u32, 41, 42],
            "name" => ["a", "b", "c"],
        )
        .unwrap();
        let frame = frame_for(df);

        let opts = RenderOptions {
            row_numbers: true,
            ..Default::default()
        };
        let cells = frame_cells(&frame, &opts).unwrap();
        assert_eq!(cells[2], vec!["42".to_string(), "c".to_string()]);
    }

    #[test]
    fn nulls_render_empty() {
        let df = df!("v" => [Some(1i64), None, Some(3)]).unwrap();
        let cells = frame_cells(&frame_for(df), &RenderOptions::default()).unwrap();
        assert_eq!(cells[1], vec!["".to_string()]);
    }
}
