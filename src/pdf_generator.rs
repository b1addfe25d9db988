use chrono::NaiveDate;
use lazy_static::lazy_static;
use printpdf::{
    BuiltinFont, Color, IndirectFontRef, Line, Mm, PdfDocument, PdfDocumentReference,
    PdfLayerReference, Point, Rect, Rgb,
};
use regex::Regex;

use crate::error::{AdvisorError, AdvisorResult};
use crate::models::{ChatTurn, Role};

// US Letter, in millimetres.
const PAGE_WIDTH: f32 = 215.9;
const PAGE_HEIGHT: f32 = 279.4;
const MARGIN: f32 = 10.0;
const PADDING: f32 = 2.0;
const BODY_TOP: f32 = PAGE_HEIGHT - 26.0;
const BODY_BOTTOM: f32 = 22.0;
const LINE_HEIGHT: f32 = 6.0;
const PT_TO_MM: f32 = 0.3528;

const TITLE_SIZE: f32 = 16.0;
const HEADING_SIZE: f32 = 14.0;
const BODY_SIZE: f32 = 11.0;
const CODE_SIZE: f32 = 10.0;
const MARGINALIA_SIZE: f32 = 8.0;

const BLACK: (u8, u8, u8) = (0, 0, 0);
const HEADING_RED: (u8, u8, u8) = (200, 16, 46);
const DIVIDER_RED: (u8, u8, u8) = (200, 16, 45);
const USER_FILL: (u8, u8, u8) = (255, 235, 224);
const CODE_FILL: (u8, u8, u8) = (230, 230, 230);

const PURPOSE: &str = "This document includes an export of the advising conversation with ChatAdv, \
an AI-powered chatbot designed to assist Farmer School of Business (FSB) students with their \
advising questions. While ChatAdv provides helpful information, students are encouraged to \
verify important details with their academic advisors.";

const DISCLAIMER: &str = "This document is a record of an AI-assisted advising session and should \
not be considered as official academic advice. Students are encouraged to verify all information \
and discuss their academic plans with their assigned academic advisors.";

lazy_static! {
    static ref BLANK_LINES: Regex = Regex::new(r"\n\s*\n").unwrap();
    static ref CODE_BLOCK: Regex = Regex::new(r"(?s)```(\w*)\n(.*?)```").unwrap();
    static ref NOT_ALPHANUMERIC: Regex = Regex::new(r"[^A-Za-z0-9_]").unwrap();
}

/// Maps typographic punctuation onto Latin-1 and drops whatever the
/// built-in fonts cannot show. Runs of blank lines collapse to one newline.
pub fn sanitize_text(text: &str) -> String {
    let collapsed = BLANK_LINES.replace_all(text, "\n");
    let mut out = String::with_capacity(collapsed.len());

    for ch in collapsed.chars() {
        match ch {
            '\u{2014}' => out.push_str("--"),
            '\u{2013}' => out.push('-'),
            '\u{2018}' | '\u{2019}' => out.push('\''),
            '\u{201C}' | '\u{201D}' => out.push('"'),
            '\u{2026}' => out.push_str("..."),
            '\u{00A0}' => out.push(' '),
            '\u{1F60A}' => out.push_str(":)"),
            c if (c as u32) <= 0xFF => out.push(c),
            _ => {}
        }
    }

    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Text(&'a str),
    Code { language: &'a str, code: &'a str },
}

/// Splits a message into prose and fenced code blocks, in order.
pub fn split_code_blocks(text: &str) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;

    for caps in CODE_BLOCK.captures_iter(text) {
        let (Some(whole), Some(code)) = (caps.get(0), caps.get(2)) else {
            continue;
        };
        let before = &text[last..whole.start()];
        if !before.trim().is_empty() {
            segments.push(Segment::Text(before));
        }
        segments.push(Segment::Code {
            language: caps.get(1).map_or("", |m| m.as_str()),
            code: code.as_str().trim_end_matches('\n'),
        });
        last = whole.end();
    }

    let rest = &text[last..];
    if !rest.trim().is_empty() {
        segments.push(Segment::Text(rest));
    }
    segments
}

/// Greedy word wrap; words longer than a line are broken.
pub fn wrap_text(text: &str, max_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let mut lines = Vec::new();

    for paragraph in text.split('\n') {
        let mut current = String::new();
        for word in paragraph.split_whitespace() {
            let word_len = word.chars().count();
            let current_len = current.chars().count();

            if current_len > 0 && current_len + 1 + word_len <= max_chars {
                current.push(' ');
                current.push_str(word);
                continue;
            }
            if current_len > 0 {
                lines.push(std::mem::take(&mut current));
            }

            let mut pieces = break_long(word, max_chars);
            current = pieces.pop().unwrap_or_default();
            lines.extend(pieces);
        }
        lines.push(current);
    }

    lines
}

/// Wraps code at a fixed column, keeping indentation.
fn wrap_code(code: &str, max_chars: usize) -> Vec<String> {
    code.split('\n')
        .flat_map(|line| {
            if line.is_empty() {
                vec![String::new()]
            } else {
                break_long(line, max_chars.max(1))
            }
        })
        .collect()
}

fn break_long(word: &str, max_chars: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars
        .chunks(max_chars)
        .map(|piece| piece.iter().collect())
        .collect()
}

/// `"Jane Q. Doe"` becomes `"Jane_Q_Doe_chatadv_advising_session.pdf"`.
pub fn export_file_name(display_name: &str) -> AdvisorResult<String> {
    let underscored = display_name.trim().replace(' ', "_");
    let cleaned = NOT_ALPHANUMERIC.replace_all(&underscored, "");
    if cleaned.trim_matches('_').is_empty() {
        return Err(AdvisorError::EmptyExportName);
    }
    Ok(format!("{}_chatadv_advising_session.pdf", cleaned))
}

/// Renders the transcript of one session, oldest turn first.
pub fn render_chat_pdf(history: &[ChatTurn], display_name: &str, date: NaiveDate) -> AdvisorResult<Vec<u8>> {
    let name = sanitize_text(display_name.trim());
    if name.is_empty() {
        return Err(AdvisorError::EmptyExportName);
    }
    let date = date.format("%b %d, %Y").to_string();

    let mut pdf = PdfWriter::new(
        &format!("{}'s ChatAdv Advising Session", name),
        &format!("Generated on {}", date),
    )?;

    pdf.title(&format!("{}'s Advising Session with ChatAdv on {}", name, date));
    pdf.gap(3.0);

    pdf.heading("ChatAdv's Purpose");
    pdf.paragraph(PURPOSE, Font::Regular, BODY_SIZE, None);
    pdf.divider();

    pdf.heading(&format!("{}'s Interaction with ChatAdv", name));
    for turn in history {
        let (label, fill) = match turn.role {
            Role::User => (format!("{}:", name), Some(USER_FILL)),
            Role::Assistant => ("ChatAdv:".to_string(), None),
        };
        let content = sanitize_text(&turn.content);

        pdf.paragraph(&label, Font::Bold, BODY_SIZE, fill);
        for segment in split_code_blocks(&content) {
            match segment {
                Segment::Text(text) => {
                    pdf.paragraph(text.trim_matches('\n'), Font::Regular, BODY_SIZE, fill);
                }
                Segment::Code { code, .. } => {
                    pdf.code(code);
                    pdf.gap(2.0);
                }
            }
        }
        pdf.gap(if turn.role == Role::User { 3.0 } else { 6.0 });
    }

    pdf.heading("Disclaimer");
    pdf.paragraph(DISCLAIMER, Font::Regular, BODY_SIZE, None);

    tracing::debug!("Rendered {} turns over {} pages", history.len(), pdf.page);
    pdf.finish()
}

#[derive(Clone, Copy)]
enum Font {
    Regular,
    Bold,
    Mono,
}

fn rgb((r, g, b): (u8, u8, u8)) -> Color {
    Color::Rgb(Rgb::new(r as f32 / 255.0, g as f32 / 255.0, b as f32 / 255.0, None))
}

fn pdf_error(err: printpdf::Error) -> AdvisorError {
    AdvisorError::Pdf(err.to_string())
}

/// Characters that fit across `width` millimetres, from an average glyph width.
fn chars_per_line(width: f32, size: f32, em_ratio: f32) -> usize {
    (width / (size * PT_TO_MM * em_ratio)).floor() as usize
}

fn text_width(text: &str, size: f32) -> f32 {
    text.chars().count() as f32 * size * PT_TO_MM * 0.5
}

/// A top-down cursor over printpdf's bottom-up pages.
struct PdfWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    mono: IndirectFontRef,
    header: String,
    footer: String,
    y: f32,
    page: usize,
}

impl PdfWriter {
    fn new(header: &str, footer: &str) -> AdvisorResult<Self> {
        let (doc, page, layer) = PdfDocument::new(header, Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), "Layer 1");
        let regular = doc.add_builtin_font(BuiltinFont::Helvetica).map_err(pdf_error)?;
        let bold = doc.add_builtin_font(BuiltinFont::HelveticaBold).map_err(pdf_error)?;
        let mono = doc.add_builtin_font(BuiltinFont::Courier).map_err(pdf_error)?;
        let layer = doc.get_page(page).get_layer(layer);

        let writer = Self {
            doc,
            layer,
            regular,
            bold,
            mono,
            header: header.to_string(),
            footer: footer.to_string(),
            y: BODY_TOP,
            page: 1,
        };
        writer.decorate();
        Ok(writer)
    }

    fn font(&self, font: Font) -> &IndirectFontRef {
        match font {
            Font::Regular => &self.regular,
            Font::Bold => &self.bold,
            Font::Mono => &self.mono,
        }
    }

    /// Header and footer, drawn once per page.
    fn decorate(&self) {
        self.layer.set_fill_color(rgb(BLACK));
        self.layer.use_text(
            self.header.clone(),
            MARGINALIA_SIZE,
            Mm(MARGIN),
            Mm(PAGE_HEIGHT - 13.0),
            &self.regular,
        );
        self.layer.use_text(
            self.footer.clone(),
            MARGINALIA_SIZE,
            Mm(MARGIN),
            Mm(10.0),
            &self.regular,
        );
        let page_label = format!("Page {}", self.page);
        let x = PAGE_WIDTH - MARGIN - text_width(&page_label, MARGINALIA_SIZE);
        self.layer
            .use_text(page_label, MARGINALIA_SIZE, Mm(x), Mm(10.0), &self.regular);
    }

    fn new_page(&mut self) {
        let (page, layer) = self
            .doc
            .add_page(Mm(PAGE_WIDTH), Mm(PAGE_HEIGHT), format!("Layer {}", self.page + 1));
        self.layer = self.doc.get_page(page).get_layer(layer);
        self.page += 1;
        self.y = BODY_TOP;
        self.decorate();
    }

    fn ensure_space(&mut self, height: f32) {
        if self.y - height < BODY_BOTTOM {
            self.new_page();
        }
    }

    fn gap(&mut self, height: f32) {
        self.y -= height;
    }

    fn line(&mut self, text: &str, font: Font, size: f32, color: (u8, u8, u8), fill: Option<(u8, u8, u8)>) {
        self.ensure_space(LINE_HEIGHT);
        let bottom = self.y - LINE_HEIGHT;

        if let Some(fill) = fill {
            self.layer.set_fill_color(rgb(fill));
            self.layer.add_rect(Rect::new(
                Mm(MARGIN),
                Mm(bottom),
                Mm(PAGE_WIDTH - MARGIN),
                Mm(self.y),
            ));
        }

        if !text.is_empty() {
            self.layer.set_fill_color(rgb(color));
            self.layer.use_text(
                text.to_string(),
                size,
                Mm(MARGIN + PADDING),
                Mm(bottom + 1.8),
                self.font(font),
            );
        }
        self.y = bottom;
    }

    fn paragraph(&mut self, text: &str, font: Font, size: f32, fill: Option<(u8, u8, u8)>) {
        let width = PAGE_WIDTH - 2.0 * (MARGIN + PADDING);
        for line in wrap_text(text, chars_per_line(width, size, 0.5)) {
            self.line(&line, font, size, BLACK, fill);
        }
    }

    fn code(&mut self, code: &str) {
        let width = PAGE_WIDTH - 2.0 * (MARGIN + PADDING);
        for line in wrap_code(code, chars_per_line(width, CODE_SIZE, 0.6)) {
            self.line(&line, Font::Mono, CODE_SIZE, BLACK, Some(CODE_FILL));
        }
    }

    fn heading(&mut self, text: &str) {
        self.gap(2.0);
        let width = PAGE_WIDTH - 2.0 * (MARGIN + PADDING);
        for line in wrap_text(text, chars_per_line(width, HEADING_SIZE, 0.55)) {
            self.line(&line, Font::Bold, HEADING_SIZE, HEADING_RED, None);
        }
        self.gap(1.0);
    }

    fn title(&mut self, text: &str) {
        let width = PAGE_WIDTH - 2.0 * MARGIN;
        for line in wrap_text(text, chars_per_line(width, TITLE_SIZE, 0.55)) {
            self.ensure_space(LINE_HEIGHT + 2.0);
            let line_width = line.chars().count() as f32 * TITLE_SIZE * PT_TO_MM * 0.55;
            let x = ((PAGE_WIDTH - line_width) / 2.0).max(MARGIN);
            self.y -= LINE_HEIGHT + 2.0;
            self.layer.set_fill_color(rgb(BLACK));
            self.layer
                .use_text(line, TITLE_SIZE, Mm(x), Mm(self.y + 1.8), &self.bold);
        }
    }

    fn divider(&mut self) {
        self.ensure_space(6.0);
        let y = self.y - 3.0;
        self.layer.set_outline_color(rgb(DIVIDER_RED));
        self.layer.set_outline_thickness(2.8);
        self.layer.add_line(Line {
            points: vec![
                (Point::new(Mm(MARGIN), Mm(y)), false),
                (Point::new(Mm(PAGE_WIDTH - MARGIN), Mm(y)), false),
            ],
            is_closed: false,
        });
        self.y -= 6.0;
    }

    fn finish(self) -> AdvisorResult<Vec<u8>> {
        self.doc.save_to_bytes().map_err(pdf_error)
    }
}
