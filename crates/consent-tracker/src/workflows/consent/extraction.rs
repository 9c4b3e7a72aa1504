use std::io::{Cursor, ErrorKind, Read};
use std::panic;
use std::path::{Component, Path, PathBuf};

use quick_xml::events::Event;
use quick_xml::Reader;
use zip::ZipArchive;

use super::domain::DocumentRef;
use super::repository::{ExtractionError, TextExtractor};

/// Reads parent uploads (plain text, PDF, DOCX) from the upload directory.
///
/// Document references are relative to the upload root. Absolute references, `..`
/// segments and symlinks resolving outside the root are rejected before anything is read.
#[derive(Debug, Clone)]
pub struct UploadExtractor {
    root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UploadFormat {
    Text,
    Pdf,
    Docx,
}

impl UploadFormat {
    fn from_extension(extension: &str) -> Option<Self> {
        match extension {
            "txt" | "text" | "md" => Some(Self::Text),
            "pdf" => Some(Self::Pdf),
            "docx" => Some(Self::Docx),
            _ => None,
        }
    }
}

impl UploadExtractor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, document: &DocumentRef) -> Result<PathBuf, ExtractionError> {
        let relative = Path::new(&document.0);
        let confined = relative
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir));
        if !confined || relative.as_os_str().is_empty() {
            return Err(ExtractionError::OutsideUploadRoot(document.clone()));
        }

        let path = self.root.join(relative);
        // A missing file canonicalizes to an error and is reported when it is read.
        if let (Ok(real), Ok(root)) = (path.canonicalize(), self.root.canonicalize()) {
            if !real.starts_with(&root) {
                return Err(ExtractionError::OutsideUploadRoot(document.clone()));
            }
        }
        Ok(path)
    }
}

impl TextExtractor for UploadExtractor {
    fn extract(&self, document: &DocumentRef) -> Result<String, ExtractionError> {
        let path = self.resolve(document)?;
        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();
        let Some(format) = UploadFormat::from_extension(&extension) else {
            return Err(ExtractionError::UnsupportedFormat {
                document: document.clone(),
                extension,
            });
        };

        let bytes = std::fs::read(&path).map_err(|source| match source.kind() {
            ErrorKind::NotFound => ExtractionError::Missing(document.clone()),
            _ => ExtractionError::Unreadable {
                document: document.clone(),
                source,
            },
        })?;

        let text = match format {
            UploadFormat::Text => String::from_utf8(bytes).map_err(|err| err.to_string()),
            UploadFormat::Pdf => pdf_text(&bytes),
            UploadFormat::Docx => docx_text(&bytes),
        };
        text.map_err(|reason| ExtractionError::Malformed {
            document: document.clone(),
            reason,
        })
    }
}

fn pdf_text(bytes: &[u8]) -> Result<String, String> {
    // pdf-extract panics on some damaged files instead of returning an error.
    match panic::catch_unwind(|| pdf_extract::extract_text_from_mem(bytes)) {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err("PDF parser aborted".to_string()),
    }
}

fn docx_text(bytes: &[u8]) -> Result<String, String> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).map_err(|err| err.to_string())?;
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|err| err.to_string())?
        .read_to_string(&mut xml)
        .map_err(|err| err.to_string())?;
    paragraph_text(&xml)
}

/// Text of a WordprocessingML body, one line per `w:p`.
fn paragraph_text(xml: &str) -> Result<String, String> {
    let mut reader = Reader::from_str(xml);
    let mut text = String::new();
    let mut in_run_text = false;

    loop {
        match reader.read_event().map_err(|err| err.to_string())? {
            Event::Start(tag) if tag.name().as_ref() == b"w:t" => in_run_text = true,
            Event::End(tag) => match tag.name().as_ref() {
                b"w:t" => in_run_text = false,
                b"w:p" => text.push('\n'),
                _ => {}
            },
            Event::Empty(tag) => match tag.name().as_ref() {
                b"w:tab" => text.push('\t'),
                b"w:br" => text.push('\n'),
                _ => {}
            },
            Event::Text(chunk) if in_run_text => {
                text.push_str(&chunk.unescape().map_err(|err| err.to_string())?);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflows::consent::classification::{classify, ConsentOutcome};
    use std::io::Write;
    use zip::write::SimpleFileOptions;
    use zip::ZipWriter;

    fn scratch_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "consent-extract-{label}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).expect("create temp dir");
        dir
    }

    fn docx_bytes(paragraphs: &[&str]) -> Vec<u8> {
        let body: String = paragraphs
            .iter()
            .map(|paragraph| format!("<w:p><w:r><w:t xml:space=\"preserve\">{paragraph}</w:t></w:r></w:p>"))
            .collect();
        let xml = format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\" standalone=\"yes\"?>\
             <w:document xmlns:w=\"http://schemas.openxmlformats.org/wordprocessingml/2006/main\">\
             <w:body>{body}</w:body></w:document>"
        );

        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("word/document.xml", SimpleFileOptions::default())
            .expect("zip entry");
        writer.write_all(xml.as_bytes()).expect("zip body");
        writer.finish().expect("zip finished").into_inner()
    }

    fn pdf_bytes(line: &str) -> Vec<u8> {
        use lopdf::content::{Content, Operation};
        use lopdf::{dictionary, Document, Object, Stream};

        let mut doc = Document::with_version("1.5");
        let pages_id = doc.new_object_id();
        let font_id = doc.add_object(dictionary! {
            "Type" => "Font",
            "Subtype" => "Type1",
            "BaseFont" => "Courier",
        });
        let resources_id = doc.add_object(dictionary! {
            "Font" => dictionary! { "F1" => font_id },
        });
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(line)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("content encodes"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
        });
        doc.objects.insert(
            pages_id,
            Object::Dictionary(dictionary! {
                "Type" => "Pages",
                "Kids" => vec![page_id.into()],
                "Count" => 1,
                "Resources" => resources_id,
                "MediaBox" => vec![0.into(), 0.into(), 595.into(), 842.into()],
            }),
        );
        let catalog_id = doc.add_object(dictionary! {
            "Type" => "Catalog",
            "Pages" => pages_id,
        });
        doc.trailer.set("Root", catalog_id);

        let mut bytes = Vec::new();
        doc.save_to(&mut bytes).expect("pdf written");
        bytes
    }

    #[test]
    fn reads_text_documents_relative_to_root() {
        let dir = scratch_dir("text");
        std::fs::write(dir.join("signed.txt"), "Я согласен").expect("write fixture");

        let extractor = UploadExtractor::new(&dir);
        let text = extractor
            .extract(&DocumentRef("signed.txt".to_string()))
            .expect("text extracted");
        assert_eq!(text, "Я согласен");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn references_outside_the_upload_root_are_rejected() {
        let outside = scratch_dir("outside");
        let root = outside.join("uploads");
        std::fs::create_dir_all(&root).expect("create upload root");
        let secret = outside.join("secret.txt");
        std::fs::write(&secret, "отказ").expect("write secret");

        let extractor = UploadExtractor::new(&root);
        for reference in [
            secret.display().to_string(),
            "../secret.txt".to_string(),
            "nested/../../secret.txt".to_string(),
            String::new(),
        ] {
            let err = extractor
                .extract(&DocumentRef(reference.clone()))
                .expect_err("escaping reference");
            assert!(
                matches!(err, ExtractionError::OutsideUploadRoot(_)),
                "{reference}: {err}"
            );
        }

        std::fs::remove_dir_all(&outside).ok();
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_leaving_the_root_are_rejected() {
        let outside = scratch_dir("symlink");
        let root = outside.join("uploads");
        std::fs::create_dir_all(&root).expect("create upload root");
        std::fs::write(outside.join("secret.txt"), "отказ").expect("write secret");
        std::os::unix::fs::symlink(outside.join("secret.txt"), root.join("link.txt"))
            .expect("symlink");

        let err = UploadExtractor::new(&root)
            .extract(&DocumentRef("link.txt".to_string()))
            .expect_err("symlink escapes");
        assert!(matches!(err, ExtractionError::OutsideUploadRoot(_)));

        std::fs::remove_dir_all(&outside).ok();
    }

    #[test]
    fn docx_paragraphs_are_extracted_and_classified() {
        let dir = scratch_dir("docx");
        std::fs::write(
            dir.join("answer.DOCX"),
            docx_bytes(&["Заявление родителя", "Я отказываюсь от участия &amp; прошу учесть"]),
        )
        .expect("write docx");

        let text = UploadExtractor::new(&dir)
            .extract(&DocumentRef("answer.DOCX".to_string()))
            .expect("docx extracted");
        assert_eq!(
            text,
            "Заявление родителя\nЯ отказываюсь от участия & прошу учесть\n"
        );
        assert_eq!(classify(&text), ConsentOutcome::Refused);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn pdf_text_is_extracted() {
        let dir = scratch_dir("pdf");
        std::fs::write(dir.join("scan.pdf"), pdf_bytes("Consent granted")).expect("write pdf");

        let text = UploadExtractor::new(&dir)
            .extract(&DocumentRef("scan.pdf".to_string()))
            .expect("pdf extracted");
        assert!(text.contains("Consent"), "extracted: {text:?}");
        assert_eq!(classify(&text), ConsentOutcome::Accepted);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn damaged_documents_are_malformed() {
        let dir = scratch_dir("damaged");
        std::fs::write(dir.join("broken.pdf"), b"%PDF-1.5 not really").expect("write pdf");
        std::fs::write(dir.join("broken.docx"), b"PK not a zip").expect("write docx");

        let extractor = UploadExtractor::new(&dir);
        for name in ["broken.pdf", "broken.docx"] {
            let err = extractor
                .extract(&DocumentRef(name.to_string()))
                .expect_err("damaged document");
            assert!(matches!(err, ExtractionError::Malformed { .. }), "{name}: {err}");
        }

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn other_formats_are_unsupported() {
        let extractor = UploadExtractor::new("uploads");
        let err = extractor
            .extract(&DocumentRef("scan.JPG".to_string()))
            .expect_err("image unsupported");
        assert!(matches!(
            err,
            ExtractionError::UnsupportedFormat { ref extension, .. } if extension == "jpg"
        ));
    }

    #[test]
    fn missing_file_is_reported() {
        let extractor = UploadExtractor::new(std::env::temp_dir());
        let err = extractor
            .extract(&DocumentRef("definitely-not-here-4821.pdf".to_string()))
            .expect_err("missing");
        assert!(matches!(err, ExtractionError::Missing(_)));
    }
}
