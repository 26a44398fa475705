// src/io/stata.rs
//! Stata `.dta` reader (releases 117, 118, 119) and writer (release 118).
//!
//! Releases 117+ wrap every section in tags (`<header>`, `<data>`, ...), so the
//! reader walks the file sequentially and verifies each tag instead of trusting
//! the offset map. Missing-value sentinels (`.` and `.a`-`.z`) become nulls.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use polars::prelude::*;

use crate::dataset::{Dataset, ValueLabels};
use crate::error::{Result, SvyError};

// Storage type codes for releases 117+
const TYPE_STRL: u16 = 32768;
const TYPE_DOUBLE: u16 = 65526;
const TYPE_FLOAT: u16 = 65527;
const TYPE_LONG: u16 = 65528;
const TYPE_INT: u16 = 65529;
const TYPE_BYTE: u16 = 65530;
const MAX_STR_WIDTH: u16 = 2045;

// Largest non-missing values per storage type
const MAX_BYTE: i8 = 100;
const MAX_INT: i16 = 32740;
const MAX_LONG: i32 = 2_147_483_620;
const MAX_FLOAT: f32 = 1.701_411_7e38;
const MAX_DOUBLE: f64 = 8.988_465_674_311_579e307;

const MISSING_LONG: i32 = 2_147_483_621;
const MISSING_DOUBLE_BITS: u64 = 0x7fe0_0000_0000_0000;

/// Field widths that differ between releases.
#[derive(Debug, Clone, Copy)]
struct Layout {
    name_len: usize,
    format_len: usize,
    varlabel_len: usize,
}

const LAYOUT_117: Layout = Layout { name_len: 33, format_len: 49, varlabel_len: 81 };
const LAYOUT_118: Layout = Layout { name_len: 129, format_len: 57, varlabel_len: 321 };

impl Layout {
    fn for_release(release: u16) -> Option<Self> {
        match release {
            117 => Some(LAYOUT_117),
            118 | 119 => Some(LAYOUT_118),
            _ => None,
        }
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    big_endian: bool,
    path: &'a str,
}

impl<'a> Reader<'a> {
    fn truncated(&self) -> SvyError {
        SvyError::format(self.path, format!("file is truncated at byte {}", self.pos))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(n).ok_or_else(|| self.truncated())?;
        if end > self.buf.len() {
            return Err(self.truncated());
        }
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn peek(&self, tag: &str) -> bool {
        self.buf[self.pos..].starts_with(tag.as_bytes())
    }

    fn expect_tag(&mut self, tag: &str) -> Result<()> {
        if !self.peek(tag) {
            if self.pos + tag.len() > self.buf.len() {
                return Err(self.truncated());
            }
            return Err(SvyError::format(
                self.path,
                format!("expected section tag {} at byte {}", tag, self.pos),
            ));
        }
        self.pos += tag.len();
        Ok(())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.array::<2>()?;
        Ok(if self.big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.array::<4>()?;
        Ok(if self.big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.array::<8>()?;
        Ok(if self.big_endian { u64::from_be_bytes(b) } else { u64::from_le_bytes(b) })
    }

    fn i8(&mut self) -> Result<i8> {
        Ok(self.u8()? as i8)
    }

    fn i16(&mut self) -> Result<i16> {
        Ok(self.u16()? as i16)
    }

    fn i32(&mut self) -> Result<i32> {
        Ok(self.u32()? as i32)
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.u32()?))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.u64()?))
    }

    /// Fixed-width, NUL-padded text field.
    fn fixed_str(&mut self, n: usize) -> Result<String> {
        Ok(decode_str(self.take(n)?))
    }
}

fn decode_str(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

enum RawColumn {
    Int(Vec<Option<i32>>),
    Float(Vec<Option<f64>>),
    Str(Vec<Option<String>>),
    StrRef(Vec<(u32, u64)>),
}

pub fn read_dta(path: &Path) -> Result<Dataset> {
    let bytes = std::fs::read(path)?;
    parse_dta(&bytes, &path.display().to_string())
}

pub fn parse_dta(bytes: &[u8], path: &str) -> Result<Dataset> {
    let mut r = Reader { buf: bytes, pos: 0, big_endian: false, path };

    if !r.peek("<stata_dta>") {
        let reason = match bytes.first() {
            Some(&b) if (102..=116).contains(&b) => {
                format!("Stata release {} files are not supported (need 117, 118 or 119)", b)
            }
            _ => "not a Stata .dta file".to_string(),
        };
        return Err(SvyError::format(path, reason));
    }
    r.expect_tag("<stata_dta>")?;
    r.expect_tag("<header>")?;

    r.expect_tag("<release>")?;
    let release_txt = decode_str(r.take(3)?);
    r.expect_tag("</release>")?;
    let release: u16 = release_txt
        .parse()
        .map_err(|_| SvyError::format(path, format!("invalid release '{}'", release_txt)))?;
    let layout = Layout::for_release(release).ok_or_else(|| {
        SvyError::format(path, format!("Stata release {} files are not supported", release))
    })?;

    r.expect_tag("<byteorder>")?;
    r.big_endian = match r.take(3)? {
        b"MSF" => true,
        b"LSF" => false,
        other => {
            return Err(SvyError::format(
                path,
                format!("unknown byte order '{}'", String::from_utf8_lossy(other)),
            ))
        }
    };
    r.expect_tag("</byteorder>")?;

    r.expect_tag("<K>")?;
    let n_vars = if release == 119 { r.u32()? as usize } else { r.u16()? as usize };
    r.expect_tag("</K>")?;

    r.expect_tag("<N>")?;
    let n_obs = if release == 117 { r.u32()? as u64 } else { r.u64()? };
    r.expect_tag("</N>")?;
    let n_obs = usize::try_from(n_obs)
        .map_err(|_| SvyError::format(path, "observation count exceeds addressable memory"))?;

    r.expect_tag("<label>")?;
    let label_len = if release == 117 { r.u8()? as usize } else { r.u16()? as usize };
    r.take(label_len)?;
    r.expect_tag("</label>")?;

    r.expect_tag("<timestamp>")?;
    let ts_len = r.u8()? as usize;
    r.take(ts_len)?;
    r.expect_tag("</timestamp>")?;
    r.expect_tag("</header>")?;

    r.expect_tag("<map>")?;
    r.take(14 * 8)?;
    r.expect_tag("</map>")?;

    r.expect_tag("<variable_types>")?;
    let types = (0..n_vars).map(|_| r.u16()).collect::<Result<Vec<_>>>()?;
    r.expect_tag("</variable_types>")?;

    r.expect_tag("<varnames>")?;
    let names = (0..n_vars)
        .map(|_| r.fixed_str(layout.name_len))
        .collect::<Result<Vec<_>>>()?;
    r.expect_tag("</varnames>")?;

    r.expect_tag("<sortlist>")?;
    let sort_width = if release == 119 { 4 } else { 2 };
    r.take((n_vars + 1) * sort_width)?;
    r.expect_tag("</sortlist>")?;

    r.expect_tag("<formats>")?;
    r.take(n_vars * layout.format_len)?;
    r.expect_tag("</formats>")?;

    r.expect_tag("<value_label_names>")?;
    let label_names = (0..n_vars)
        .map(|_| r.fixed_str(layout.name_len))
        .collect::<Result<Vec<_>>>()?;
    r.expect_tag("</value_label_names>")?;

    r.expect_tag("<variable_labels>")?;
    let var_labels = (0..n_vars)
        .map(|_| r.fixed_str(layout.varlabel_len))
        .collect::<Result<Vec<_>>>()?;
    r.expect_tag("</variable_labels>")?;

    r.expect_tag("<characteristics>")?;
    while r.peek("<ch>") {
        r.expect_tag("<ch>")?;
        let len = r.u32()? as usize;
        r.take(len)?;
        r.expect_tag("</ch>")?;
    }
    r.expect_tag("</characteristics>")?;

    r.expect_tag("<data>")?;
    let row_width = types
        .iter()
        .map(|&t| {
            storage_width(t).ok_or_else(|| SvyError::format(path, format!("unknown storage type code {}", t)))
        })
        .sum::<Result<usize>>()?;
    // the header row count must fit in what is left of the file
    let remaining = bytes.len() - r.pos;
    if row_width > 0 && n_obs.checked_mul(row_width).map_or(true, |need| need > remaining) {
        return Err(SvyError::format(
            path,
            format!(
                "header declares {} rows of {} bytes but only {} data bytes remain",
                n_obs, row_width, remaining
            ),
        ));
    }
    let n_obs = if row_width == 0 { 0 } else { n_obs };
    let mut columns = types
        .iter()
        .map(|&t| match t {
            TYPE_BYTE | TYPE_INT | TYPE_LONG => Ok(RawColumn::Int(Vec::with_capacity(n_obs))),
            TYPE_FLOAT | TYPE_DOUBLE => Ok(RawColumn::Float(Vec::with_capacity(n_obs))),
            TYPE_STRL => Ok(RawColumn::StrRef(Vec::with_capacity(n_obs))),
            1..=MAX_STR_WIDTH => Ok(RawColumn::Str(Vec::with_capacity(n_obs))),
            other => Err(SvyError::format(path, format!("unknown storage type code {}", other))),
        })
        .collect::<Result<Vec<_>>>()?;

    for _ in 0..n_obs {
        for (col, &t) in columns.iter_mut().zip(types.iter()) {
            match col {
                RawColumn::Int(values) => {
                    let v = match t {
                        TYPE_BYTE => Some(r.i8()?).filter(|&v| v <= MAX_BYTE).map(i32::from),
                        TYPE_INT => Some(r.i16()?).filter(|&v| v <= MAX_INT).map(i32::from),
                        _ => Some(r.i32()?).filter(|&v| v <= MAX_LONG),
                    };
                    values.push(v);
                }
                RawColumn::Float(values) => {
                    let v = if t == TYPE_FLOAT {
                        Some(r.f32()?).filter(|v| v.is_finite() && *v <= MAX_FLOAT).map(f64::from)
                    } else {
                        Some(r.f64()?).filter(|v| v.is_finite() && *v <= MAX_DOUBLE)
                    };
                    values.push(v);
                }
                RawColumn::Str(values) => {
                    let s = r.fixed_str(t as usize)?;
                    values.push(if s.is_empty() { None } else { Some(s) });
                }
                RawColumn::StrRef(values) => {
                    let z = r.u64()?;
                    values.push(split_strl_ref(z, release, r.big_endian));
                }
            }
        }
    }
    r.expect_tag("</data>")?;

    r.expect_tag("<strls>")?;
    let mut strls: HashMap<(u32, u64), String> = HashMap::new();
    while r.peek("GSO") {
        r.expect_tag("GSO")?;
        let v = r.u32()?;
        let o = if release == 117 { r.u32()? as u64 } else { r.u64()? };
        let kind = r.u8()?;
        let len = r.u32()? as usize;
        let data = r.take(len)?;
        // 130 = ASCII with trailing NUL, 129 = binary
        let text = if kind == 130 { decode_str(data) } else { String::from_utf8_lossy(data).into_owned() };
        strls.insert((v, o), text);
    }
    r.expect_tag("</strls>")?;

    r.expect_tag("<value_labels>")?;
    let mut tables: HashMap<String, ValueLabels> = HashMap::new();
    while r.peek("<lbl>") {
        r.expect_tag("<lbl>")?;
        let _len = r.i32()?;
        let name = r.fixed_str(layout.name_len)?;
        r.take(3)?;
        let table = read_label_table(&mut r)?;
        tables.insert(name, table);
        r.expect_tag("</lbl>")?;
    }
    r.expect_tag("</value_labels>")?;
    r.expect_tag("</stata_dta>")?;

    let mut frame_columns: Vec<Column> = Vec::with_capacity(n_vars);
    for (name, raw) in names.iter().zip(columns) {
        let series = match raw {
            RawColumn::Int(v) => Series::new(name.as_str().into(), v),
            RawColumn::Float(v) => Series::new(name.as_str().into(), v),
            RawColumn::Str(v) => Series::new(name.as_str().into(), v),
            RawColumn::StrRef(refs) => {
                let v: Vec<Option<String>> = refs
                    .iter()
                    .map(|key| {
                        if *key == (0, 0) {
                            None
                        } else {
                            strls.get(key).cloned().filter(|s| !s.is_empty())
                        }
                    })
                    .collect();
                Series::new(name.as_str().into(), v)
            }
        };
        frame_columns.push(series.into());
    }
    let frame = DataFrame::new(frame_columns)?;

    let mut value_labels = HashMap::new();
    let mut variable_labels = HashMap::new();
    for ((name, label_name), var_label) in names.iter().zip(&label_names).zip(&var_labels) {
        if !label_name.is_empty() {
            match tables.get(label_name) {
                Some(table) => {
                    value_labels.insert(name.clone(), table.clone());
                }
                None => log::warn!(
                    "{}: variable '{}' refers to missing value-label table '{}'",
                    path,
                    name,
                    label_name
                ),
            }
        }
        if !var_label.is_empty() {
            variable_labels.insert(name.clone(), var_label.clone());
        }
    }

    log::info!(
        "Loaded {} (Stata release {}): {} rows x {} columns, {} labelled",
        path,
        release,
        n_obs,
        n_vars,
        value_labels.len()
    );
    Ok(Dataset::with_labels(frame, value_labels, variable_labels))
}

/// Bytes one value of storage type `t` occupies in the data section.
fn storage_width(t: u16) -> Option<usize> {
    match t {
        TYPE_BYTE => Some(1),
        TYPE_INT => Some(2),
        TYPE_LONG | TYPE_FLOAT => Some(4),
        TYPE_DOUBLE | TYPE_STRL => Some(8),
        1..=MAX_STR_WIDTH => Some(t as usize),
        _ => None,
    }
}

fn split_strl_ref(z: u64, release: u16, big_endian: bool) -> (u32, u64) {
    match (release, big_endian) {
        (117, false) => ((z & 0xffff_ffff) as u32, z >> 32),
        (117, true) => ((z >> 32) as u32, z & 0xffff_ffff),
        (118, false) => ((z & 0xffff) as u32, z >> 16),
        (118, true) => ((z >> 48) as u32, z & 0xffff_ffff_ffff),
        (_, false) => ((z & 0xff_ffff) as u32, z >> 24),
        (_, true) => ((z >> 40) as u32, z & 0xff_ffff_ffff),
    }
}

fn read_label_table(r: &mut Reader<'_>) -> Result<ValueLabels> {
    let n = r.i32()?;
    let txt_len = r.i32()?;
    if n < 0 || txt_len < 0 {
        return Err(SvyError::format(r.path, "negative size in value-label table"));
    }
    let offsets = (0..n).map(|_| r.i32()).collect::<Result<Vec<_>>>()?;
    let values = (0..n).map(|_| r.i32()).collect::<Result<Vec<_>>>()?;
    let txt = r.take(txt_len as usize)?;

    let mut table = BTreeMap::new();
    for (&off, &val) in offsets.iter().zip(values.iter()) {
        let off = off as usize;
        if off >= txt.len() {
            return Err(SvyError::format(r.path, "value-label offset outside its text block"));
        }
        table.insert(val as i64, decode_str(&txt[off..]));
    }
    Ok(table)
}

// ============================================================================
// Writer
// ============================================================================

enum StoredColumn {
    Long(Vec<Option<i32>>),
    Double(Vec<Option<f64>>),
    Str(Vec<Option<String>>, u16),
}

impl StoredColumn {
    fn type_code(&self) -> u16 {
        match self {
            StoredColumn::Long(_) => TYPE_LONG,
            StoredColumn::Double(_) => TYPE_DOUBLE,
            StoredColumn::Str(_, width) => *width,
        }
    }

    fn display_format(&self) -> String {
        match self {
            StoredColumn::Long(_) => "%12.0g".to_string(),
            StoredColumn::Double(_) => "%10.0g".to_string(),
            StoredColumn::Str(_, width) => format!("%{}s", width),
        }
    }
}

fn store_column(ds: &Dataset, name: &str) -> Result<StoredColumn> {
    let col = ds.column(name)?;
    match col.dtype() {
        DataType::Float32 | DataType::Float64 => Ok(StoredColumn::Double(ds.numeric(name)?)),
        DataType::String => {
            let values = ds.text(name)?;
            let width = values.iter().flatten().map(|s| s.len()).max().unwrap_or(1).max(1);
            if width > MAX_STR_WIDTH as usize {
                return Err(SvyError::config(format!(
                    "string column '{}' holds values longer than {} bytes",
                    name, MAX_STR_WIDTH
                )));
            }
            Ok(StoredColumn::Str(values, width as u16))
        }
        dt if crate::dataset::is_numeric_dtype(dt) => {
            let values = ds.numeric(name)?;
            let fits = values
                .iter()
                .flatten()
                .all(|v| *v >= -(MAX_LONG as f64) && *v <= MAX_LONG as f64);
            if fits {
                Ok(StoredColumn::Long(values.into_iter().map(|v| v.map(|x| x as i32)).collect()))
            } else {
                Ok(StoredColumn::Double(values))
            }
        }
        other => Err(SvyError::config(format!(
            "column '{}' has type {:?}, which cannot be stored in a .dta file",
            name, other
        ))),
    }
}

fn put_fixed(out: &mut Vec<u8>, text: &str, width: usize) -> Result<()> {
    let bytes = text.as_bytes();
    if bytes.len() >= width {
        return Err(SvyError::config(format!(
            "'{}' does not fit in a {}-byte .dta field",
            text, width
        )));
    }
    out.extend_from_slice(bytes);
    out.resize(out.len() + width - bytes.len(), 0);
    Ok(())
}

/// Serializes a dataset as a little-endian release 118 file.
pub fn encode_dta(ds: &Dataset) -> Result<Vec<u8>> {
    let layout = LAYOUT_118;
    let names = ds.column_names();
    if names.len() > u16::MAX as usize {
        return Err(SvyError::config("too many columns for a release 118 .dta file"));
    }
    let stored = names.iter().map(|n| store_column(ds, n)).collect::<Result<Vec<_>>>()?;

    let mut out: Vec<u8> = Vec::new();
    let mut map = [0u64; 14];

    out.extend_from_slice(b"<stata_dta><header><release>118</release><byteorder>LSF</byteorder>");
    out.extend_from_slice(b"<K>");
    out.extend_from_slice(&(names.len() as u16).to_le_bytes());
    out.extend_from_slice(b"</K><N>");
    out.extend_from_slice(&(ds.height() as u64).to_le_bytes());
    out.extend_from_slice(b"</N><label>");
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(b"</label><timestamp>");
    out.push(0);
    out.extend_from_slice(b"</timestamp></header>");

    map[1] = out.len() as u64;
    out.extend_from_slice(b"<map>");
    let map_pos = out.len();
    out.resize(out.len() + 14 * 8, 0);
    out.extend_from_slice(b"</map>");

    map[2] = out.len() as u64;
    out.extend_from_slice(b"<variable_types>");
    for col in &stored {
        out.extend_from_slice(&col.type_code().to_le_bytes());
    }
    out.extend_from_slice(b"</variable_types>");

    map[3] = out.len() as u64;
    out.extend_from_slice(b"<varnames>");
    for name in &names {
        put_fixed(&mut out, name, layout.name_len)?;
    }
    out.extend_from_slice(b"</varnames>");

    map[4] = out.len() as u64;
    out.extend_from_slice(b"<sortlist>");
    out.resize(out.len() + (names.len() + 1) * 2, 0);
    out.extend_from_slice(b"</sortlist>");

    map[5] = out.len() as u64;
    out.extend_from_slice(b"<formats>");
    for col in &stored {
        put_fixed(&mut out, &col.display_format(), layout.format_len)?;
    }
    out.extend_from_slice(b"</formats>");

    map[6] = out.len() as u64;
    out.extend_from_slice(b"<value_label_names>");
    for name in &names {
        let table_name = if ds.value_labels(name).is_some() { name.as_str() } else { "" };
        put_fixed(&mut out, table_name, layout.name_len)?;
    }
    out.extend_from_slice(b"</value_label_names>");

    map[7] = out.len() as u64;
    out.extend_from_slice(b"<variable_labels>");
    for name in &names {
        put_fixed(&mut out, ds.variable_label(name).unwrap_or(""), layout.varlabel_len)?;
    }
    out.extend_from_slice(b"</variable_labels>");

    map[8] = out.len() as u64;
    out.extend_from_slice(b"<characteristics></characteristics>");

    map[9] = out.len() as u64;
    out.extend_from_slice(b"<data>");
    for row in 0..ds.height() {
        for col in &stored {
            match col {
                StoredColumn::Long(v) => {
                    out.extend_from_slice(&v[row].unwrap_or(MISSING_LONG).to_le_bytes())
                }
                StoredColumn::Double(v) => {
                    let bits = v[row].map(f64::to_bits).unwrap_or(MISSING_DOUBLE_BITS);
                    out.extend_from_slice(&bits.to_le_bytes());
                }
                StoredColumn::Str(v, width) => {
                    let s = v[row].as_deref().unwrap_or("");
                    out.extend_from_slice(s.as_bytes());
                    out.resize(out.len() + *width as usize - s.len(), 0);
                }
            }
        }
    }
    out.extend_from_slice(b"</data>");

    map[10] = out.len() as u64;
    out.extend_from_slice(b"<strls></strls>");

    map[11] = out.len() as u64;
    out.extend_from_slice(b"<value_labels>");
    for name in &names {
        if let Some(table) = ds.value_labels(name) {
            let mut txt: Vec<u8> = Vec::new();
            let mut offsets = Vec::with_capacity(table.len());
            let mut values = Vec::with_capacity(table.len());
            for (&code, label) in table {
                let code = i32::try_from(code).map_err(|_| {
                    SvyError::config(format!("value label code {} of '{}' exceeds 32 bits", code, name))
                })?;
                offsets.push(txt.len() as i32);
                values.push(code);
                txt.extend_from_slice(label.as_bytes());
                txt.push(0);
            }
            let n = table.len();
            let body_len = 8 + 8 * n + txt.len();
            out.extend_from_slice(b"<lbl>");
            out.extend_from_slice(&(body_len as i32).to_le_bytes());
            put_fixed(&mut out, name, layout.name_len)?;
            out.extend_from_slice(&[0u8; 3]);
            out.extend_from_slice(&(n as i32).to_le_bytes());
            out.extend_from_slice(&(txt.len() as i32).to_le_bytes());
            for off in &offsets {
                out.extend_from_slice(&off.to_le_bytes());
            }
            for val in &values {
                out.extend_from_slice(&val.to_le_bytes());
            }
            out.extend_from_slice(&txt);
            out.extend_from_slice(b"</lbl>");
        }
    }
    out.extend_from_slice(b"</value_labels>");

    map[12] = out.len() as u64;
    out.extend_from_slice(b"</stata_dta>");
    map[13] = out.len() as u64;

    for (i, offset) in map.iter().enumerate() {
        let at = map_pos + i * 8;
        out[at..at + 8].copy_from_slice(&offset.to_le_bytes());
    }
    Ok(out)
}

pub fn write_dta(ds: &Dataset, path: &Path) -> Result<()> {
    let bytes = encode_dta(ds)?;
    std::fs::write(path, bytes)?;
    log::info!("Wrote {} rows x {} columns to {}", ds.height(), ds.column_names().len(), path.display());
    Ok(())
}
