//! Text-run extraction from page content streams.
//!
//! Walks the text operators of a page and reports each shown string with its
//! text rendering matrix. Glyph advances are estimated at half the font size per
//! character since font metrics are not consulted; the current transformation
//! matrix (`cm`) is not applied.

use doc_model::TextRun;
use lopdf::content::Content;
use lopdf::{Document, Object, ObjectId};

use crate::PdfEngineError;

pub const IDENTITY: [f64; 6] = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];

/// Average glyph advance as a fraction of the font size.
const GLYPH_ADVANCE_EM: f64 = 0.5;

/// TJ adjustments at or below this (thousandths of an em) are treated as word gaps.
const TJ_SPACE_THRESHOLD: f64 = -250.0;

/// Composes two affine matrices: the result applies `inner` first, then `outer`.
pub fn multiply(outer: &[f64; 6], inner: &[f64; 6]) -> [f64; 6] {
    [
        outer[0] * inner[0] + outer[2] * inner[1],
        outer[1] * inner[0] + outer[3] * inner[1],
        outer[0] * inner[2] + outer[2] * inner[3],
        outer[1] * inner[2] + outer[3] * inner[3],
        outer[0] * inner[4] + outer[2] * inner[5] + outer[4],
        outer[1] * inner[4] + outer[3] * inner[5] + outer[5],
    ]
}

#[derive(Debug, Clone)]
struct TextState {
    matrix: [f64; 6],
    line_matrix: [f64; 6],
    font_size: f64,
    leading: f64,
}

impl Default for TextState {
    fn default() -> Self {
        Self { matrix: IDENTITY, line_matrix: IDENTITY, font_size: 12.0, leading: 0.0 }
    }
}

impl TextState {
    fn begin(&mut self) {
        self.matrix = IDENTITY;
        self.line_matrix = IDENTITY;
    }

    fn move_line(&mut self, tx: f64, ty: f64) {
        self.line_matrix = multiply(&self.line_matrix, &[1.0, 0.0, 0.0, 1.0, tx, ty]);
        self.matrix = self.line_matrix;
    }

    fn next_line(&mut self) {
        self.move_line(0.0, -self.leading);
    }

    fn set_matrix(&mut self, matrix: [f64; 6]) {
        self.matrix = matrix;
        self.line_matrix = matrix;
    }

    fn show(&mut self, text: String, runs: &mut Vec<TextRun>) {
        let glyphs = text.chars().count() as f64;
        if glyphs == 0.0 {
            return;
        }

        let size = self.font_size;
        let advance = glyphs * size * GLYPH_ADVANCE_EM;
        let transform = multiply(&self.matrix, &[size, 0.0, 0.0, size, 0.0, 0.0]);
        let horizontal_scale = self.matrix[0].hypot(self.matrix[1]);
        let vertical_scale = self.matrix[2].hypot(self.matrix[3]);

        runs.push(TextRun {
            text,
            transform,
            width: advance * horizontal_scale,
            height: size * vertical_scale,
        });

        self.matrix = multiply(&self.matrix, &[1.0, 0.0, 0.0, 1.0, advance, 0.0]);
    }
}

pub(crate) fn extract_runs(
    doc: &Document,
    page_id: ObjectId,
) -> Result<Vec<TextRun>, PdfEngineError> {
    let bytes = doc.get_page_content(page_id)?;
    let content = Content::decode(&bytes)?;

    let mut state = TextState::default();
    let mut runs = Vec::new();

    for operation in content.operations {
        let operands = &operation.operands;
        match operation.operator.as_str() {
            "BT" => state.begin(),
            "Tf" => {
                if let Some(size) = operands.get(1).and_then(number) {
                    state.font_size = size;
                }
            }
            "TL" => {
                if let Some(leading) = operands.first().and_then(number) {
                    state.leading = leading;
                }
            }
            "Td" | "TD" => {
                let (Some(tx), Some(ty)) =
                    (operands.first().and_then(number), operands.get(1).and_then(number))
                else {
                    continue;
                };
                if operation.operator == "TD" {
                    state.leading = -ty;
                }
                state.move_line(tx, ty);
            }
            "Tm" => {
                let values: Vec<f64> = operands.iter().filter_map(number).collect();
                if let [a, b, c, d, e, f] = values[..] {
                    state.set_matrix([a, b, c, d, e, f]);
                }
            }
            "T*" => state.next_line(),
            "Tj" => {
                if let Some(text) = operands.first().and_then(decode_string) {
                    state.show(text, &mut runs);
                }
            }
            "'" => {
                state.next_line();
                if let Some(text) = operands.first().and_then(decode_string) {
                    state.show(text, &mut runs);
                }
            }
            "\"" => {
                state.next_line();
                if let Some(text) = operands.get(2).and_then(decode_string) {
                    state.show(text, &mut runs);
                }
            }
            "TJ" => {
                if let Some(Object::Array(parts)) = operands.first() {
                    let text = join_tj_parts(parts);
                    state.show(text, &mut runs);
                }
            }
            _ => {}
        }
    }

    Ok(runs)
}

fn join_tj_parts(parts: &[Object]) -> String {
    let mut text = String::new();
    for part in parts {
        match part {
            Object::String(..) => {
                if let Some(piece) = decode_string(part) {
                    text.push_str(&piece);
                }
            }
            other => {
                if number(other).is_some_and(|adjust| adjust <= TJ_SPACE_THRESHOLD)
                    && !text.ends_with(' ')
                {
                    text.push(' ');
                }
            }
        }
    }
    text
}

fn number(object: &Object) -> Option<f64> {
    match object {
        Object::Integer(value) => Some(*value as f64),
        Object::Real(value) => Some(f64::from(*value)),
        _ => None,
    }
}

/// Decodes a string operand: UTF-16BE when it carries a byte-order mark, otherwise
/// one character per byte.
fn decode_string(object: &Object) -> Option<String> {
    let Object::String(bytes, _) = object else {
        return None;
    };

    if let [0xFE, 0xFF, rest @ ..] = bytes.as_slice() {
        let units: Vec<u16> =
            rest.chunks_exact(2).map(|pair| u16::from_be_bytes([pair[0], pair[1]])).collect();
        return Some(String::from_utf16_lossy(&units));
    }

    Some(bytes.iter().map(|&byte| char::from(byte)).collect())
}
