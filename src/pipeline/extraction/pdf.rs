//! Structural PDF extraction.
//!
//! Page text comes from `pdf-extract`, which honours each font's
//! `/Encoding` and `/ToUnicode` map. Embedded images are enumerated with
//! lopdf from each page's `/Resources /XObject` dictionary.

use std::panic::{catch_unwind, AssertUnwindSafe};

use image::ImageOutputFormat;
use lopdf::{Document, Object, ObjectId};

use super::sanitize::{normalize_whitespace, sanitize_extracted_text};
use super::types::{EmbeddedImage, StructuralPage, StructuralTextExtractor};
use super::ExtractionError;

/// Structural text extractor for PDFs with a text layer.
pub struct PdfTextExtractor;

impl StructuralTextExtractor for PdfTextExtractor {
    fn page_count(&self, pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        let doc = load_document(pdf_bytes)?;
        Ok(doc.get_pages().len())
    }

    fn extract_pages(&self, pdf_bytes: &[u8]) -> Result<Vec<StructuralPage>, ExtractionError> {
        let doc = load_document(pdf_bytes)?;
        let mut texts = page_texts(pdf_bytes)?.into_iter();

        let pages = doc
            .get_pages()
            .into_iter()
            .map(|(page_number, page_id)| StructuralPage {
                page_number,
                text: texts
                    .next()
                    .map(|raw| sanitize_extracted_text(&normalize_whitespace(&raw)))
                    .unwrap_or_default(),
                images: page_images(&doc, page_number, page_id),
            })
            .collect::<Vec<_>>();

        tracing::debug!(
            pages = pages.len(),
            pages_with_text = pages.iter().filter(|p| !p.text.is_empty()).count(),
            images = pages.iter().map(|p| p.images.len()).sum::<usize>(),
            "Structural extraction complete"
        );

        Ok(pages)
    }
}

fn load_document(pdf_bytes: &[u8]) -> Result<Document, ExtractionError> {
    Document::load_mem(pdf_bytes)
        .map_err(|e| ExtractionError::PdfParsing(format!("Failed to parse PDF: {e}")))
}

/// Raw text of every page, in page order.
///
/// Some font programs make pdf-extract panic; that is reported as a parse
/// failure so the next strategy can take over.
fn page_texts(pdf_bytes: &[u8]) -> Result<Vec<String>, ExtractionError> {
    catch_unwind(AssertUnwindSafe(|| {
        pdf_extract::extract_text_from_mem_by_pages(pdf_bytes)
    }))
    .map_err(|_| ExtractionError::PdfParsing("Text extraction panicked on this PDF".into()))?
    .map_err(|e| ExtractionError::PdfParsing(format!("Text extraction failed: {e}")))
}

// ── Embedded images ──────────────────────────────────────────────────────

/// Enumerate image XObjects on a page.
///
/// Walks: page dict → /Resources → /XObject → entries with /Subtype /Image.
/// A page without resources simply has no images.
fn page_images(doc: &Document, page_number: u32, page_id: ObjectId) -> Vec<EmbeddedImage> {
    let Ok(page_dict) = doc.get_object(page_id).and_then(Object::as_dict) else {
        return Vec::new();
    };
    let Ok(resources) = resolve_dict_entry(doc, page_dict, b"Resources") else {
        return Vec::new();
    };
    let Ok(xobjects) = resolve_dict_entry(doc, resources, b"XObject") else {
        return Vec::new();
    };

    let mut images = Vec::new();
    for (name, obj_ref) in xobjects.iter() {
        let Object::Stream(stream) = resolve_object(doc, obj_ref) else {
            continue;
        };
        if !is_image_subtype(&stream.dict) {
            continue;
        }

        let name = String::from_utf8_lossy(name).into_owned();
        let data = match extract_image_bytes(doc, stream) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                tracing::warn!(page = page_number, image = %name, error = %e, "Embedded image not decodable");
                None
            }
        };

        images.push(EmbeddedImage {
            width: get_dimension(&stream.dict, b"Width").unwrap_or(0),
            height: get_dimension(&stream.dict, b"Height").unwrap_or(0),
            filter: filter_name(&stream.dict),
            name,
            data,
        });
    }

    images
}

/// Check if a stream dictionary has /Subtype /Image.
fn is_image_subtype(dict: &lopdf::Dictionary) -> bool {
    dict.get(b"Subtype")
        .map(|obj| matches!(obj, Object::Name(ref n) if n == b"Image"))
        .unwrap_or(false)
}

/// Last filter in the chain, which determines the stored image encoding.
fn filter_name(dict: &lopdf::Dictionary) -> Option<String> {
    match dict.get(b"Filter").ok()? {
        Object::Name(n) => Some(String::from_utf8_lossy(n).into_owned()),
        Object::Array(arr) => arr.iter().rev().find_map(|o| match o {
            Object::Name(n) => Some(String::from_utf8_lossy(n).into_owned()),
            _ => None,
        }),
        _ => None,
    }
}

/// Extract image bytes from a PDF stream, handling different filters.
fn extract_image_bytes(
    doc: &Document,
    stream: &lopdf::Stream,
) -> Result<Vec<u8>, ExtractionError> {
    let content = stream
        .decompressed_content()
        .unwrap_or_else(|_| stream.content.clone());

    // DCTDecode = JPEG. The stream content is the JPEG file.
    if filter_name(&stream.dict).as_deref() == Some("DCTDecode") {
        return Ok(content);
    }

    // Some streams contain full image files (TIFF, PNG)
    if image::load_from_memory(&content).is_ok() {
        return Ok(content);
    }

    reconstruct_raw_image(doc, &stream.dict, &content)
}

/// Reconstruct a PNG from raw 8-bit pixel data using the image dictionary.
fn reconstruct_raw_image(
    doc: &Document,
    dict: &lopdf::Dictionary,
    raw_pixels: &[u8],
) -> Result<Vec<u8>, ExtractionError> {
    let width = get_dimension(dict, b"Width")?;
    let height = get_dimension(dict, b"Height")?;
    let bpc = get_int(dict, b"BitsPerComponent").unwrap_or(8);
    if bpc != 8 {
        return Err(ExtractionError::ImageProcessing(format!(
            "Unsupported bits per component: {bpc}"
        )));
    }

    let channels = determine_channels(doc, dict);
    let expected_size = (width as usize)
        .checked_mul(height as usize)
        .and_then(|n| n.checked_mul(channels as usize))
        .ok_or_else(|| {
            ExtractionError::ImageProcessing(format!(
                "Image dimensions overflow: {width}x{height}x{channels}"
            ))
        })?;
    if raw_pixels.len() < expected_size {
        return Err(ExtractionError::ImageProcessing(format!(
            "Raw pixel buffer too small: {} bytes, expected {} ({}x{}x{})",
            raw_pixels.len(),
            expected_size,
            width,
            height,
            channels
        )));
    }
    let pixels = raw_pixels[..expected_size].to_vec();

    let img = match channels {
        1 => image::GrayImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageLuma8),
        3 => image::RgbImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageRgb8),
        4 => image::RgbaImage::from_raw(width, height, pixels).map(image::DynamicImage::ImageRgba8),
        _ => None,
    }
    .ok_or_else(|| {
        ExtractionError::ImageProcessing(format!("Cannot build image with {channels} channels"))
    })?;

    let mut png_buf = std::io::Cursor::new(Vec::new());
    img.write_to(&mut png_buf, ImageOutputFormat::Png)
        .map_err(|e| ExtractionError::ImageProcessing(format!("PNG encode failed: {e}")))?;

    Ok(png_buf.into_inner())
}

/// Determine the number of color channels from the /ColorSpace entry.
fn determine_channels(doc: &Document, dict: &lopdf::Dictionary) -> u32 {
    let cs = match dict.get(b"ColorSpace") {
        Ok(obj) => resolve_object(doc, obj),
        Err(_) => return 3,
    };

    match cs {
        Object::Name(ref n) => match n.as_slice() {
            b"DeviceGray" => 1,
            b"DeviceCMYK" => 4,
            _ => 3,
        },
        Object::Array(ref arr) if !arr.is_empty() => match &arr[0] {
            Object::Name(ref n) if n == b"ICCBased" => arr
                .get(1)
                .map(|o| resolve_object(doc, o))
                .and_then(|o| match o {
                    Object::Stream(s) => get_int(&s.dict, b"N").ok(),
                    _ => None,
                })
                .unwrap_or(3) as u32,
            Object::Name(ref n) if n == b"Indexed" => 1,
            _ => 3,
        },
        _ => 3,
    }
}

/// Resolve a PDF object reference to its target, or return the object as-is.
fn resolve_object<'a>(doc: &'a Document, obj: &'a Object) -> &'a Object {
    match obj {
        Object::Reference(id) => doc.get_object(*id).unwrap_or(obj),
        _ => obj,
    }
}

/// Get a dictionary entry, following references, and return as a Dictionary.
fn resolve_dict_entry<'a>(
    doc: &'a Document,
    dict: &'a lopdf::Dictionary,
    key: &[u8],
) -> Result<&'a lopdf::Dictionary, ExtractionError> {
    let obj = dict.get(key).map_err(|_| {
        ExtractionError::PdfParsing(format!(
            "Missing /{} in dictionary",
            String::from_utf8_lossy(key)
        ))
    })?;

    resolve_object(doc, obj).as_dict().map_err(|_| {
        ExtractionError::PdfParsing(format!(
            "/{} is not a dictionary",
            String::from_utf8_lossy(key)
        ))
    })
}

/// Get an integer value from a dictionary.
fn get_int(dict: &lopdf::Dictionary, key: &[u8]) -> Result<i64, ExtractionError> {
    dict.get(key)
        .ok()
        .and_then(|o| o.as_i64().ok())
        .ok_or_else(|| {
            ExtractionError::PdfParsing(format!(
                "Missing or non-integer /{}",
                String::from_utf8_lossy(key)
            ))
        })
}

/// A strictly positive pixel dimension that fits in `u32`.
fn get_dimension(dict: &lopdf::Dictionary, key: &[u8]) -> Result<u32, ExtractionError> {
    let value = get_int(dict, key)?;
    u32::try_from(value)
        .ok()
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            ExtractionError::ImageProcessing(format!(
                "Invalid /{}: {value}",
                String::from_utf8_lossy(key)
            ))
        })
}

// ── Mock for testing ─────────────────────────────────────────────────────

/// Returns fixed pages regardless of input bytes.
pub struct MockStructuralExtractor {
    pages: Vec<StructuralPage>,
}

impl MockStructuralExtractor {
    /// One page per entry, numbered from 1, no images.
    pub fn new(texts: &[&str]) -> Self {
        let pages = texts
            .iter()
            .enumerate()
            .map(|(i, text)| StructuralPage {
                page_number: i as u32 + 1,
                text: text.to_string(),
                images: Vec::new(),
            })
            .collect();
        Self { pages }
    }

    pub fn with_pages(pages: Vec<StructuralPage>) -> Self {
        Self { pages }
    }
}

impl StructuralTextExtractor for MockStructuralExtractor {
    fn page_count(&self, _pdf_bytes: &[u8]) -> Result<usize, ExtractionError> {
        Ok(self.pages.len())
    }

    fn extract_pages(&self, _pdf_bytes: &[u8]) -> Result<Vec<StructuralPage>, ExtractionError> {
        Ok(self.pages.clone())
    }
}

// ── Test fixtures ────────────────────────────────────────────────────────

/// Build a PDF whose pages carry the given raw content streams.
/// Shared with the orchestrator and API tests.
#[cfg(test)]
pub(crate) fn make_test_pdf_with_contents(contents: &[Vec<u8>]) -> Vec<u8> {
    use lopdf::{dictionary, Stream};

    let mut doc = Document::with_version("1.4");

    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Helvetica",
    });

    let pages_id = doc.new_object_id();
    let mut kids = Vec::new();
    for content in contents {
        let content_id = doc.add_object(Stream::new(dictionary! {}, content.clone()));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Contents" => content_id,
            "Resources" => dictionary! {
                "Font" => dictionary! { "F1" => font_id },
            },
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
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buf = Vec::new();
    doc.save_to(&mut buf).expect("write test PDF");
    buf
}

/// One page per entry, each showing its text with a single `Tj`.
#[cfg(test)]
pub(crate) fn make_test_pdf(pages: &[&str]) -> Vec<u8> {
    let contents: Vec<Vec<u8>> = pages
        .iter()
        .map(|text| {
            if text.is_empty() {
                Vec::new()
            } else {
                format!("BT /F1 12 Tf 72 720 Td ({text}) Tj ET").into_bytes()
            }
        })
        .collect();
    make_test_pdf_with_contents(&contents)
}
