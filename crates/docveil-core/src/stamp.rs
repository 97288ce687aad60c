//! Visible provenance stamping for PDF documents.
//!
//! Every page receives a top-margin and a bottom-margin line
//! `CONFIDENTIAL | User: <identity> | ID: <id> | <issued-at>` at 9 pt, full
//! opacity, plus a large diagonal `PROTECTED - <id>` across the center at
//! 10% opacity. The stamp is an overlay: a new content stream appended after
//! the page's original streams, so existing page content is never replaced.
//! Output is deterministic for a fixed `issued_at`.

use chrono::{DateTime, SecondsFormat, Utc};
use lopdf::{dictionary, Dictionary, Document, Object, ObjectId, Stream};

use crate::error::EngineError;

const MARGIN_FONT_SIZE: f32 = 9.0;
const DIAGONAL_FONT_SIZE: f32 = 30.0;
const DIAGONAL_OPACITY: f32 = 0.10;
// cos 45° = sin 45°
const DIAG: f32 = 0.70711;

fn pdf_err(e: lopdf::Error) -> EngineError {
    EngineError::MarkingFailed(e.to_string())
}

/// The human-readable provenance line stamped into the margins.
pub fn provenance_line(identity: &str, subject_id: u64, issued_at: DateTime<Utc>) -> String {
    format!(
        "CONFIDENTIAL | User: {} | ID: {} | {}",
        identity,
        subject_id,
        issued_at.to_rfc3339_opts(SecondsFormat::Millis, true)
    )
}

/// Stamp every page of `source` with visible provenance marks.
///
/// Fails with [`EngineError::MarkingFailed`] when `source` is not a
/// parseable PDF.
pub fn stamp_pdf(
    source: &[u8],
    identity: &str,
    subject_id: u64,
    issued_at: DateTime<Utc>,
) -> Result<Vec<u8>, EngineError> {
    let mut doc = Document::load_mem(source)
        .map_err(|e| EngineError::MarkingFailed(format!("not a valid PDF: {e}")))?;

    let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
    if pages.is_empty() {
        return Err(EngineError::MarkingFailed("document has no pages".into()));
    }

    let line = provenance_line(identity, subject_id, issued_at);
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });
    let gs_id = doc.add_object(dictionary! {
        "Type" => "ExtGState",
        "ca" => DIAGONAL_OPACITY,
        "CA" => DIAGONAL_OPACITY,
    });

    for page_id in pages {
        let (width, height) = page_size(&doc, page_id);
        let ops = overlay_content(&line, subject_id, width, height);
        let overlay_id = doc.add_object(Stream::new(dictionary! {}, ops.into_bytes()));
        attach_resources(&mut doc, page_id, font_id, gs_id)?;
        append_content(&mut doc, page_id, overlay_id)?;
    }

    let mut out = Vec::new();
    doc.save_to(&mut out)
        .map_err(|e| EngineError::MarkingFailed(e.to_string()))?;
    Ok(out)
}

/// MediaBox lookup, following the Pages inheritance chain. Falls back to
/// US Letter when no box is declared anywhere.
fn page_size(doc: &Document, page_id: ObjectId) -> (f32, f32) {
    let mut current = page_id;
    for _ in 0..16 {
        let Ok(dict) = doc.get_dictionary(current) else {
            break;
        };
        if let Ok(object) = dict.get(b"MediaBox") {
            if let Some(size) = rect_size(doc, object) {
                return size;
            }
        }
        match dict.get(b"Parent") {
            Ok(Object::Reference(parent)) => current = *parent,
            _ => break,
        }
    }
    (612.0, 792.0)
}

fn rect_size(doc: &Document, object: &Object) -> Option<(f32, f32)> {
    let array = match object {
        Object::Array(items) => items.clone(),
        Object::Reference(id) => doc.get_object(*id).ok()?.as_array().ok()?.clone(),
        _ => return None,
    };
    if array.len() != 4 {
        return None;
    }
    let number = |object: &Object| match object {
        Object::Integer(value) => Some(*value as f32),
        Object::Real(value) => Some(*value),
        _ => None,
    };
    let x0 = number(&array[0])?;
    let y0 = number(&array[1])?;
    let x1 = number(&array[2])?;
    let y1 = number(&array[3])?;
    Some(((x1 - x0).abs(), (y1 - y0).abs()))
}

/// Escape a string for a PDF literal string object.
fn pdf_escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            _ => out.push(ch),
        }
    }
    out
}

fn overlay_content(line: &str, subject_id: u64, width: f32, height: f32) -> String {
    let margin_text = pdf_escape(line);
    let diagonal_text = pdf_escape(&format!("PROTECTED - {subject_id}"));
    let mut ops = String::new();
    // margin lines, full opacity
    ops.push_str("q\nBT\n");
    ops.push_str(&format!("/DvF1 {MARGIN_FONT_SIZE} Tf\n1 0 0 rg\n"));
    ops.push_str(&format!(
        "1 0 0 1 30 {:.2} Tm\n({margin_text}) Tj\n",
        height - 30.0
    ));
    ops.push_str(&format!("1 0 0 1 30 20 Tm\n({margin_text}) Tj\n"));
    ops.push_str("ET\nQ\n");
    // diagonal center stamp, low opacity
    ops.push_str("q\n/DvGS gs\nBT\n");
    ops.push_str(&format!("/DvF1 {DIAGONAL_FONT_SIZE} Tf\n1 0 0 rg\n"));
    ops.push_str(&format!(
        "{DIAG} {DIAG} -{DIAG} {DIAG} {:.2} {:.2} Tm\n({diagonal_text}) Tj\n",
        width / 4.0,
        height / 2.0
    ));
    ops.push_str("ET\nQ\n");
    ops
}

/// Make the overlay font and graphics state reachable from the page's
/// resource dictionary, wherever that dictionary lives (inline, referenced,
/// or absent). Existing resources are extended, never replaced.
fn attach_resources(
    doc: &mut Document,
    page_id: ObjectId,
    font_id: ObjectId,
    gs_id: ObjectId,
) -> Result<(), EngineError> {
    enum Slot {
        Inline,
        Referenced(ObjectId),
        Missing,
    }

    let slot = {
        let page = doc.get_dictionary(page_id).map_err(pdf_err)?;
        match page.get(b"Resources") {
            Ok(Object::Reference(id)) => Slot::Referenced(*id),
            Ok(Object::Dictionary(_)) => Slot::Inline,
            _ => Slot::Missing,
        }
    };

    let deferred = match slot {
        Slot::Missing => {
            let resources = dictionary! {
                "Font" => Object::Dictionary(dictionary! {
                    "DvF1" => Object::Reference(font_id),
                }),
                "ExtGState" => Object::Dictionary(dictionary! {
                    "DvGS" => Object::Reference(gs_id),
                }),
            };
            doc.get_dictionary_mut(page_id)
                .map_err(pdf_err)?
                .set("Resources", Object::Dictionary(resources));
            Vec::new()
        }
        Slot::Inline => {
            let page = doc.get_dictionary_mut(page_id).map_err(pdf_err)?;
            let resources = page
                .get_mut(b"Resources")
                .and_then(|object| object.as_dict_mut())
                .map_err(pdf_err)?;
            patch_categories(resources, font_id, gs_id)
        }
        Slot::Referenced(id) => {
            let resources = doc.get_dictionary_mut(id).map_err(pdf_err)?;
            patch_categories(resources, font_id, gs_id)
        }
    };

    // categories that were themselves indirect objects
    for (category_id, name, target) in deferred {
        doc.get_dictionary_mut(category_id)
            .map_err(pdf_err)?
            .set(name, Object::Reference(target));
    }
    Ok(())
}

/// Insert the overlay entries into the Font and ExtGState sub-dictionaries.
/// Returns the patches that must go through another indirect object.
fn patch_categories(
    resources: &mut Dictionary,
    font_id: ObjectId,
    gs_id: ObjectId,
) -> Vec<(ObjectId, &'static str, ObjectId)> {
    let mut deferred = Vec::new();
    for (category, name, target) in [("Font", "DvF1", font_id), ("ExtGState", "DvGS", gs_id)] {
        match resources.get_mut(category.as_bytes()) {
            Ok(Object::Dictionary(existing)) => {
                existing.set(name, Object::Reference(target));
            }
            Ok(Object::Reference(id)) => deferred.push((*id, name, target)),
            _ => {
                let mut fresh = Dictionary::new();
                fresh.set(name, Object::Reference(target));
                resources.set(category, Object::Dictionary(fresh));
            }
        }
    }
    deferred
}

/// Append the overlay stream after the page's existing content so the
/// original drawing operations stay untouched.
fn append_content(
    doc: &mut Document,
    page_id: ObjectId,
    overlay_id: ObjectId,
) -> Result<(), EngineError> {
    let current = doc
        .get_dictionary(page_id)
        .map_err(pdf_err)?
        .get(b"Contents")
        .ok()
        .cloned();
    let contents = match current {
        Some(Object::Array(mut items)) => {
            items.push(Object::Reference(overlay_id));
            Object::Array(items)
        }
        Some(reference @ Object::Reference(_)) => {
            Object::Array(vec![reference, Object::Reference(overlay_id)])
        }
        Some(Object::Stream(stream)) => {
            let stream_id = doc.add_object(Object::Stream(stream));
            Object::Array(vec![
                Object::Reference(stream_id),
                Object::Reference(overlay_id),
            ])
        }
        _ => Object::Reference(overlay_id),
    };
    doc.get_dictionary_mut(page_id)
        .map_err(pdf_err)?
        .set("Contents", contents);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal valid PDF with `page_count` empty pages.
    pub(crate) fn minimal_pdf(page_count: usize) -> Vec<u8> {
        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let mut kids = Vec::new();
        for _ in 0..page_count {
            let content_id = doc.add_object(Stream::new(dictionary! {}, b"BT ET".to_vec()));
            let page_id = doc.add_object(dictionary! {
                "Type" => "Page",
                "Parent" => Object::Reference(pages_id),
                "MediaBox" => vec![
                    Object::Integer(0),
                    Object::Integer(0),
                    Object::Integer(612),
                    Object::Integer(792),
                ],
                "Contents" => Object::Reference(content_id),
            });
            kids.push(Object::Reference(page_id));
        }
        let count = kids.len() as i64;
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => kids,
                "Count" => count,
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => Object::Reference(pages_id),
        });
        doc.trailer.set("Root", Object::Reference(catalog_id));
        let mut out = Vec::new();
        doc.save_to(&mut out).unwrap();
        out
    }

    /// Concatenated decompressed content of every page.
    fn all_page_content(bytes: &[u8]) -> String {
        let doc = Document::load_mem(bytes).unwrap();
        let mut all = String::new();
        for (_, page_id) in doc.get_pages() {
            let content = doc.get_page_content(page_id).unwrap();
            all.push_str(&String::from_utf8_lossy(&content));
            all.push('\n');
        }
        all
    }

    #[test]
    fn stamps_every_page_with_margins_and_diagonal() {
        let source = minimal_pdf(3);
        let issued = Utc::now();
        let marked = stamp_pdf(&source, "alice@example.com", 42, issued).unwrap();
        let doc = Document::load_mem(&marked).unwrap();
        for (_, page_id) in doc.get_pages() {
            let content = String::from_utf8_lossy(&doc.get_page_content(page_id).unwrap())
                .into_owned();
            assert!(content.contains("CONFIDENTIAL | User: alice@example.com | ID: 42"));
            assert!(content.contains("PROTECTED - 42"));
            // two margin lines plus one diagonal
            assert_eq!(content.matches("ID: 42").count(), 2);
            // original content survives the overlay
            assert!(content.contains("BT ET"));
        }
    }

    #[test]
    fn deterministic_for_fixed_timestamp() {
        let source = minimal_pdf(1);
        let issued = Utc::now();
        let a = stamp_pdf(&source, "bob@example.com", 7, issued).unwrap();
        let b = stamp_pdf(&source, "bob@example.com", 7, issued).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn garbage_input_is_marking_failed() {
        let err = stamp_pdf(b"definitely not a pdf", "x", 1, Utc::now()).unwrap_err();
        assert!(matches!(err, EngineError::MarkingFailed(_)));
    }

    #[test]
    fn parenthesised_identity_is_escaped() {
        let source = minimal_pdf(1);
        let marked = stamp_pdf(&source, "weird (identity)", 9, Utc::now()).unwrap();
        let content = all_page_content(&marked);
        assert!(content.contains("weird \\(identity\\)"));
    }

    #[test]
    fn marked_document_still_parses_and_keeps_page_count() {
        let source = minimal_pdf(5);
        let marked = stamp_pdf(&source, "carol@example.com", 3, Utc::now()).unwrap();
        let doc = Document::load_mem(&marked).unwrap();
        assert_eq!(doc.get_pages().len(), 5);
    }
}
