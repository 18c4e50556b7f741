//! EPUB3 assembly from per-page OCR text.
//!
//! A pure transform: ordered page texts plus metadata in, one `.epub` file
//! out. Chapters group consecutive pages, paragraphs become `<p>` elements,
//! and pages without text get a styled placeholder so the reader can see
//! where recognition failed. Output is byte-deterministic for identical
//! inputs (fixed zip timestamps, fixed modification metadata).

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::utils::html_escape;

/// Errors that can occur while writing the EPUB.
#[derive(Debug, Error)]
pub enum AssembleError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Archive error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

/// Reading direction and typography for a language tag.
struct LangProfile {
    dir: &'static str,
    lang: &'static str,
    font_family: &'static str,
}

/// Unknown tags fall back to the Persian profile.
fn lang_profile(language: &str) -> LangProfile {
    match language {
        "en" => LangProfile {
            dir: "ltr",
            lang: "en",
            font_family: "Georgia, serif",
        },
        "ar" => LangProfile {
            dir: "rtl",
            lang: "ar",
            font_family: "Tahoma, 'Noto Naskh Arabic', serif",
        },
        _ => LangProfile {
            dir: "rtl",
            lang: "fa",
            font_family: "Tahoma, 'Noto Naskh Arabic', serif",
        },
    }
}

// Fixed so identical inputs produce identical archives.
const MODIFIED_STAMP: &str = "2020-01-01T00:00:00Z";

/// Build an EPUB3 file from page texts.
///
/// `pages` maps 0-based page index to extracted text; indices absent from the
/// map (or holding only whitespace) render as placeholders. The chapter count
/// depends only on `total_pages` and `pages_per_chapter`.
pub fn assemble_epub(
    pages: &BTreeMap<u32, String>,
    total_pages: u32,
    output_path: &Path,
    title: &str,
    language: &str,
    pages_per_chapter: u32,
) -> Result<(), AssembleError> {
    let profile = lang_profile(language);
    let pages_per_chapter = pages_per_chapter.max(1);

    if let Some(parent) = output_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = File::create(output_path)?;
    let mut zip = ZipWriter::new(file);

    let stored = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Stored)
        .last_modified_time(zip::DateTime::default());
    let deflated = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default());

    // The mimetype entry must come first and be stored uncompressed.
    zip.start_file("mimetype", stored)?;
    zip.write_all(b"application/epub+zip")?;

    zip.start_file("META-INF/container.xml", deflated)?;
    zip.write_all(CONTAINER_XML.as_bytes())?;

    let chapter_count = total_pages.div_ceil(pages_per_chapter);

    zip.start_file("OEBPS/content.opf", deflated)?;
    zip.write_all(content_opf(title, &profile, chapter_count).as_bytes())?;

    zip.start_file("OEBPS/nav.xhtml", deflated)?;
    zip.write_all(nav_xhtml(&profile, total_pages, pages_per_chapter).as_bytes())?;

    zip.start_file("OEBPS/style/default.css", deflated)?;
    zip.write_all(stylesheet(&profile).as_bytes())?;

    for chapter in 0..chapter_count {
        let ch_start = chapter * pages_per_chapter;
        let ch_end = (ch_start + pages_per_chapter).min(total_pages);

        zip.start_file(format!("OEBPS/chapter_{:03}.xhtml", chapter + 1), deflated)?;
        zip.write_all(chapter_xhtml(pages, ch_start, ch_end, &profile).as_bytes())?;
    }

    zip.finish()?;
    Ok(())
}

const CONTAINER_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles>
    <rootfile full-path="OEBPS/content.opf" media-type="application/oebps-package+xml"/>
  </rootfiles>
</container>
"#;

fn content_opf(title: &str, profile: &LangProfile, chapter_count: u32) -> String {
    let mut manifest = String::new();
    let mut spine = String::new();
    for chapter in 1..=chapter_count {
        manifest.push_str(&format!(
            "    <item id=\"chapter_{0:03}\" href=\"chapter_{0:03}.xhtml\" media-type=\"application/xhtml+xml\"/>\n",
            chapter
        ));
        spine.push_str(&format!(
            "    <itemref idref=\"chapter_{:03}\"/>\n",
            chapter
        ));
    }

    let progression = if profile.dir == "rtl" {
        " page-progression-direction=\"rtl\""
    } else {
        ""
    };

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="3.0" unique-identifier="book-id">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:identifier id="book-id">reflow-epub</dc:identifier>
    <dc:title>{title}</dc:title>
    <dc:language>{lang}</dc:language>
    <meta property="dcterms:modified">{modified}</meta>
  </metadata>
  <manifest>
    <item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>
    <item id="style" href="style/default.css" media-type="text/css"/>
{manifest}  </manifest>
  <spine{progression}>
{spine}  </spine>
</package>
"#,
        title = html_escape(title),
        lang = profile.lang,
        modified = MODIFIED_STAMP,
        manifest = manifest,
        progression = progression,
        spine = spine,
    )
}

fn nav_xhtml(profile: &LangProfile, total_pages: u32, pages_per_chapter: u32) -> String {
    let mut entries = String::new();
    let chapter_count = total_pages.div_ceil(pages_per_chapter);
    for chapter in 0..chapter_count {
        let ch_start = chapter * pages_per_chapter;
        let ch_end = (ch_start + pages_per_chapter).min(total_pages);
        entries.push_str(&format!(
            "      <li><a href=\"chapter_{:03}.xhtml\">Pages {}&#8211;{}</a></li>\n",
            chapter + 1,
            ch_start + 1,
            ch_end
        ));
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops" dir="{dir}" xml:lang="{lang}">
<head><title>Contents</title></head>
<body>
  <nav epub:type="toc">
    <ol>
{entries}    </ol>
  </nav>
</body>
</html>
"#,
        dir = profile.dir,
        lang = profile.lang,
        entries = entries,
    )
}

fn stylesheet(profile: &LangProfile) -> String {
    format!(
        r#"body {{
    direction: {dir};
    unicode-bidi: embed;
    font-family: {font_family};
    font-size: 1.1em;
    line-height: 1.8;
    margin: 1em;
    text-align: justify;
}}
p {{
    margin: 0.5em 0;
    text-indent: 1em;
}}
.failed-page {{
    color: #999;
    font-style: italic;
    text-align: center;
    padding: 2em 0;
}}
"#,
        dir = profile.dir,
        font_family = profile.font_family,
    )
}

fn chapter_xhtml(
    pages: &BTreeMap<u32, String>,
    ch_start: u32,
    ch_end: u32,
    profile: &LangProfile,
) -> String {
    let mut body = String::new();
    for page in ch_start..ch_end {
        match pages.get(&page).map(|t| t.trim()).filter(|t| !t.is_empty()) {
            Some(text) => {
                for para in text.split("\n\n") {
                    let para = para.trim();
                    if !para.is_empty() {
                        body.push_str("<p>");
                        body.push_str(&html_escape(para).replace('\n', "<br/>"));
                        body.push_str("</p>");
                    }
                }
            }
            None => {
                body.push_str(&format!(
                    "<p class=\"failed-page\">[Page {}: OCR failed]</p>",
                    page + 1
                ));
            }
        }
    }

    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" dir="{dir}" xml:lang="{lang}">
<head>
  <title>Pages {start}&#8211;{end}</title>
  <link rel="stylesheet" type="text/css" href="style/default.css"/>
</head>
<body dir="{dir}">{body}</body>
</html>
"#,
        dir = profile.dir,
        lang = profile.lang,
        start = ch_start + 1,
        end = ch_end,
        body = body,
    )
}
