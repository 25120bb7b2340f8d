//! Streaming XLSX writer.
//!
//! Serializes a single-worksheet workbook straight into any `io::Write` sink.
//! The container is a ZIP archive produced in pure streaming mode: every part
//! carries a data descriptor (general-purpose bit 3), so no seeking or
//! back-patching is needed and bytes leave the process as soon as a DEFLATE
//! block fills. Cell text is written as inline strings; there is no
//! shared-string table and no cell styling, both of which would grow memory
//! with the row count.
//!
//! Memory use is therefore bounded by the compressor's internal buffer plus
//! one serialized row, independent of how many rows pass through.

use std::io::Write;
use std::mem;

use flate2::write::DeflateEncoder;
use flate2::{Compression, Crc};

#[derive(Debug, thiserror::Error)]
pub enum XlsxError {
    /// The sink went away mid-write, e.g. the HTTP client disconnected.
    #[error("write past destroyed sink")]
    SinkClosed,
    #[error("spreadsheet write failed: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for XlsxError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::BrokenPipe {
            XlsxError::SinkClosed
        } else {
            XlsxError::Io(e)
        }
    }
}

#[derive(Debug, Clone)]
pub struct Column {
    pub header: String,
    pub width: f64,
}

#[derive(Debug, Clone)]
pub struct SheetSchema {
    pub sheet_name: String,
    pub columns: Vec<Column>,
}

/// One cell value. `Number` carries a pre-rendered numeric literal, used
/// where f64 would lose precision (decimals, wide integers).
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Number(String),
    Text(String),
}

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#;

const ROOT_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

const STYLES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="2"><fill><patternFill patternType="none"/></fill><fill><patternFill patternType="gray125"/></fill></fills><borders count="1"><border/></borders><cellStyleXfs count="1"><xf/></cellStyleXfs><cellXfs count="1"><xf xfId="0"/></cellXfs></styleSheet>"#;

/// Streams one worksheet into `sink`. `open` emits all fixed workbook parts
/// and the header row; `add_row` appends and flushes one data row;
/// `finalize` closes the worksheet and the archive. Closing the sink itself
/// remains the caller's job.
#[derive(Debug)]
pub struct XlsxStreamWriter<W: Write> {
    zip: ZipStreamWriter<W>,
    column_count: usize,
    /// 1-based index of the next worksheet row to be written.
    next_row: u32,
    /// Reused serialization buffer; rows never accumulate here.
    row_buf: String,
}

impl<W: Write> XlsxStreamWriter<W> {
    pub fn open(sink: W, schema: &SheetSchema) -> Result<Self, XlsxError> {
        let mut zip = ZipStreamWriter::new(sink);

        zip.start_entry("[Content_Types].xml")?;
        zip.write_data(CONTENT_TYPES_XML.as_bytes())?;
        zip.finish_entry()?;

        zip.start_entry("_rels/.rels")?;
        zip.write_data(ROOT_RELS_XML.as_bytes())?;
        zip.finish_entry()?;

        let mut workbook = String::with_capacity(512);
        workbook.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        workbook.push('\n');
        workbook.push_str(r#"<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name=""#);
        push_escaped(&mut workbook, &schema.sheet_name);
        workbook.push_str(r#"" sheetId="1" r:id="rId1"/></sheets></workbook>"#);
        zip.start_entry("xl/workbook.xml")?;
        zip.write_data(workbook.as_bytes())?;
        zip.finish_entry()?;

        zip.start_entry("xl/_rels/workbook.xml.rels")?;
        zip.write_data(WORKBOOK_RELS_XML.as_bytes())?;
        zip.finish_entry()?;

        zip.start_entry("xl/styles.xml")?;
        zip.write_data(STYLES_XML.as_bytes())?;
        zip.finish_entry()?;

        zip.start_entry("xl/worksheets/sheet1.xml")?;
        let mut prolog = String::with_capacity(1024);
        prolog.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
        prolog.push('\n');
        prolog.push_str(r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><cols>"#);
        for (i, column) in schema.columns.iter().enumerate() {
            let n = i + 1;
            prolog.push_str(&format!(
                r#"<col min="{n}" max="{n}" width="{}" customWidth="1"/>"#,
                column.width
            ));
        }
        prolog.push_str("</cols><sheetData>");
        zip.write_data(prolog.as_bytes())?;

        let mut writer = XlsxStreamWriter {
            zip,
            column_count: schema.columns.len(),
            next_row: 1,
            row_buf: String::with_capacity(1024),
        };

        let header: Vec<Cell> = schema
            .columns
            .iter()
            .map(|c| Cell::Text(c.header.clone()))
            .collect();
        writer.add_row(&header)?;
        Ok(writer)
    }

    /// Appends one row in schema order and pushes its bytes downstream.
    pub fn add_row(&mut self, cells: &[Cell]) -> Result<(), XlsxError> {
        debug_assert_eq!(cells.len(), self.column_count);
        let row = self.next_row;
        self.row_buf.clear();
        self.row_buf.push_str(&format!(r#"<row r="{row}">"#));
        for (col, cell) in cells.iter().enumerate() {
            push_cell(&mut self.row_buf, row, col as u32, cell);
        }
        self.row_buf.push_str("</row>");
        self.zip.write_data(self.row_buf.as_bytes())?;
        self.next_row += 1;
        Ok(())
    }

    /// Closes the worksheet and writes the archive central directory. The
    /// sink is handed back for the caller to flush and close.
    pub fn finalize(mut self) -> Result<W, XlsxError> {
        self.zip.write_data(b"</sheetData></worksheet>")?;
        self.zip.finish_entry()?;
        Ok(self.zip.finish()?)
    }
}

fn push_cell(buf: &mut String, row: u32, col: u32, cell: &Cell) {
    buf.push_str("<c r=\"");
    push_col_letters(buf, col);
    buf.push_str(&row.to_string());
    match cell {
        Cell::Null => buf.push_str("\"/>"),
        Cell::Bool(b) => {
            buf.push_str("\" t=\"b\"><v>");
            buf.push(if *b { '1' } else { '0' });
            buf.push_str("</v></c>");
        }
        Cell::Int(v) => {
            buf.push_str("\"><v>");
            buf.push_str(&v.to_string());
            buf.push_str("</v></c>");
        }
        Cell::Float(v) => {
            buf.push_str("\"><v>");
            buf.push_str(&v.to_string());
            buf.push_str("</v></c>");
        }
        Cell::Number(v) => {
            buf.push_str("\"><v>");
            push_escaped(buf, v);
            buf.push_str("</v></c>");
        }
        Cell::Text(v) => {
            buf.push_str("\" t=\"inlineStr\"><is><t xml:space=\"preserve\">");
            push_escaped(buf, v);
            buf.push_str("</t></is></c>");
        }
    }
}

/// 0-based column index to spreadsheet letters (0 → A, 26 → AA).
fn push_col_letters(buf: &mut String, mut col: u32) {
    let mut tmp = [0u8; 7];
    let mut n = 0;
    loop {
        tmp[n] = b'A' + (col % 26) as u8;
        n += 1;
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    for i in (0..n).rev() {
        buf.push(tmp[i] as char);
    }
}

fn push_escaped(buf: &mut String, value: &str) {
    for c in value.chars() {
        match c {
            '&' => buf.push_str("&amp;"),
            '<' => buf.push_str("&lt;"),
            '>' => buf.push_str("&gt;"),
            '"' => buf.push_str("&quot;"),
            // control characters are not representable in XML 1.0
            c if (c as u32) < 0x20 && c != '\t' && c != '\n' && c != '\r' => {}
            c => buf.push(c),
        }
    }
}

const LOCAL_HEADER_SIG: u32 = 0x04034b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x08074b50;
const CENTRAL_HEADER_SIG: u32 = 0x02014b50;
const EOCD_SIG: u32 = 0x06054b50;
const ZIP_VERSION: u16 = 20;
// bit 3: sizes in the data descriptor; bit 11: UTF-8 names
const ZIP_FLAGS: u16 = (1 << 3) | (1 << 11);
const METHOD_DEFLATE: u16 = 8;

#[derive(Debug)]
struct CentralDirRecord {
    name: String,
    crc: u32,
    compressed: u64,
    uncompressed: u64,
    header_offset: u64,
}

#[derive(Debug)]
struct CountingWriter<W: Write> {
    inner: W,
    count: u64,
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[derive(Debug)]
enum ZipState<W: Write> {
    Between(CountingWriter<W>),
    InEntry {
        encoder: DeflateEncoder<CountingWriter<W>>,
        crc: Crc,
        uncompressed: u64,
        data_start: u64,
        header_offset: u64,
        name: String,
    },
    // transient while switching states; also left behind after an I/O error
    Poisoned,
}

/// Sequential streaming ZIP writer. Entries are opened, written and closed
/// strictly one at a time; the central directory is emitted by `finish`.
#[derive(Debug)]
struct ZipStreamWriter<W: Write> {
    state: ZipState<W>,
    dir: Vec<CentralDirRecord>,
}

impl<W: Write> ZipStreamWriter<W> {
    fn new(sink: W) -> Self {
        ZipStreamWriter {
            state: ZipState::Between(CountingWriter {
                inner: sink,
                count: 0,
            }),
            dir: Vec::new(),
        }
    }

    fn start_entry(&mut self, name: &str) -> std::io::Result<()> {
        let ZipState::Between(mut out) = mem::replace(&mut self.state, ZipState::Poisoned) else {
            panic!("start_entry with an archive entry still open");
        };
        let header_offset = out.count;
        write_u32(&mut out, LOCAL_HEADER_SIG)?;
        write_u16(&mut out, ZIP_VERSION)?;
        write_u16(&mut out, ZIP_FLAGS)?;
        write_u16(&mut out, METHOD_DEFLATE)?;
        write_u16(&mut out, 0)?; // mod time
        write_u16(&mut out, 0)?; // mod date
        write_u32(&mut out, 0)?; // crc: in the data descriptor
        write_u32(&mut out, 0)?; // compressed size: ditto
        write_u32(&mut out, 0)?; // uncompressed size: ditto
        write_u16(&mut out, name.len() as u16)?;
        write_u16(&mut out, 0)?; // extra field length
        out.write_all(name.as_bytes())?;
        let data_start = out.count;
        self.state = ZipState::InEntry {
            encoder: DeflateEncoder::new(out, Compression::fast()),
            crc: Crc::new(),
            uncompressed: 0,
            data_start,
            header_offset,
            name: name.to_string(),
        };
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> std::io::Result<()> {
        let ZipState::InEntry {
            encoder,
            crc,
            uncompressed,
            ..
        } = &mut self.state
        else {
            panic!("write_data with no archive entry open");
        };
        crc.update(data);
        *uncompressed += data.len() as u64;
        encoder.write_all(data)
    }

    fn finish_entry(&mut self) -> std::io::Result<()> {
        let ZipState::InEntry {
            encoder,
            crc,
            uncompressed,
            data_start,
            header_offset,
            name,
        } = mem::replace(&mut self.state, ZipState::Poisoned)
        else {
            panic!("finish_entry with no archive entry open");
        };
        let mut out = encoder.finish()?;
        let compressed = out.count - data_start;
        let crc = crc.sum();
        write_u32(&mut out, DATA_DESCRIPTOR_SIG)?;
        write_u32(&mut out, crc)?;
        write_u32(&mut out, compressed as u32)?;
        write_u32(&mut out, uncompressed as u32)?;
        self.dir.push(CentralDirRecord {
            name,
            crc,
            compressed,
            uncompressed,
            header_offset,
        });
        self.state = ZipState::Between(out);
        Ok(())
    }

    fn finish(self) -> std::io::Result<W> {
        let ZipState::Between(mut out) = self.state else {
            panic!("finish with an archive entry still open");
        };
        let dir_start = out.count;
        for rec in &self.dir {
            write_u32(&mut out, CENTRAL_HEADER_SIG)?;
            write_u16(&mut out, ZIP_VERSION)?; // version made by
            write_u16(&mut out, ZIP_VERSION)?; // version needed
            write_u16(&mut out, ZIP_FLAGS)?;
            write_u16(&mut out, METHOD_DEFLATE)?;
            write_u16(&mut out, 0)?; // mod time
            write_u16(&mut out, 0)?; // mod date
            write_u32(&mut out, rec.crc)?;
            write_u32(&mut out, rec.compressed as u32)?;
            write_u32(&mut out, rec.uncompressed as u32)?;
            write_u16(&mut out, rec.name.len() as u16)?;
            write_u16(&mut out, 0)?; // extra field length
            write_u16(&mut out, 0)?; // comment length
            write_u16(&mut out, 0)?; // disk number
            write_u16(&mut out, 0)?; // internal attributes
            write_u32(&mut out, 0)?; // external attributes
            write_u32(&mut out, rec.header_offset as u32)?;
            out.write_all(rec.name.as_bytes())?;
        }
        let dir_size = out.count - dir_start;
        write_u32(&mut out, EOCD_SIG)?;
        write_u16(&mut out, 0)?; // this disk
        write_u16(&mut out, 0)?; // central dir disk
        write_u16(&mut out, self.dir.len() as u16)?;
        write_u16(&mut out, self.dir.len() as u16)?;
        write_u32(&mut out, dir_size as u32)?;
        write_u32(&mut out, dir_start as u32)?;
        write_u16(&mut out, 0)?; // comment length
        Ok(out.inner)
    }
}

fn write_u16<W: Write>(out: &mut W, v: u16) -> std::io::Result<()> {
    out.write_all(&v.to_le_bytes())
}

fn write_u32<W: Write>(out: &mut W, v: u32) -> std::io::Result<()> {
    out.write_all(&v.to_le_bytes())
}
