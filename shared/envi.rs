//! ENVI raw images: a binary payload next to a plain-text `.hdr` header.
//!
//! ```text
//! ENVI
//! samples = 400
//! lines = 300
//! bands = 6
//! header offset = 0
//! data type = 12
//! interleave = bsq
//! byte order = 0
//! map info = {UTM, 1, 1, 300000, 5800000, 30, 30, 32, North, WGS-84}
//! ```

use bytemuck::Pod;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::raster::{DataType, RasterError, RasterHeader};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Interleave {
    Bsq,
    Bil,
    Bip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ByteOrder {
    Little,
    Big,
}

/// Parsed header together with the payload layout it describes.
#[derive(Clone, Debug, PartialEq)]
pub struct EnviHeader {
    pub raster: RasterHeader,
    pub interleave: Interleave,
    pub byte_order: ByteOrder,
    pub header_offset: u64,
}

/// Header written next to a new data file: `scene.img` -> `scene.hdr`.
pub fn header_path(data: &Path) -> PathBuf {
    data.with_extension("hdr")
}

/// Finds the header of an existing data file, accepting both `scene.hdr`
/// and `scene.img.hdr`.
pub fn locate_header(data: &Path) -> Option<PathBuf> {
    let mut appended = data.as_os_str().to_owned();
    appended.push(".hdr");
    [header_path(data), PathBuf::from(appended)]
        .into_iter()
        .find(|candidate| candidate.is_file())
}

impl EnviHeader {
    /// Band-sequential layout in little-endian order.
    pub fn for_output(raster: RasterHeader) -> Self {
        Self {
            raster,
            interleave: Interleave::Bsq,
            byte_order: ByteOrder::Little,
            header_offset: 0,
        }
    }

    pub fn read_for(data: &Path) -> Result<Self, RasterError> {
        let path = locate_header(data).ok_or_else(|| RasterError::HeaderParse {
            path: header_path(data),
            message: format!("no ENVI header found for {}", data.display()),
        })?;
        let text = fs::read_to_string(&path).map_err(|source| RasterError::Io {
            path: path.clone(),
            source,
        })?;
        let header = Self::parse(&text)
            .map_err(|message| RasterError::HeaderParse { path, message })?;
        header.raster.validate()?;
        Ok(header)
    }

    pub fn parse(text: &str) -> Result<Self, String> {
        let fields = parse_fields(text)?;
        let get = |key: &str| fields.get(key).map(String::as_str);
        let count = |key: &str| -> Result<usize, String> {
            get(key)
                .ok_or_else(|| format!("missing '{key}'"))?
                .parse::<usize>()
                .map_err(|e| format!("'{key}': {e}"))
        };

        let data_type = match count("data type")? {
            1 => DataType::U8,
            2 => DataType::I16,
            3 => DataType::I32,
            4 => DataType::F32,
            5 => DataType::F64,
            12 => DataType::U16,
            13 => DataType::U32,
            other => return Err(format!("unsupported data type code {other}")),
        };
        let interleave = match get("interleave").map(str::to_ascii_lowercase).as_deref() {
            None | Some("bsq") => Interleave::Bsq,
            Some("bil") => Interleave::Bil,
            Some("bip") => Interleave::Bip,
            Some(other) => return Err(format!("unknown interleave '{other}'")),
        };
        let byte_order = match get("byte order") {
            None | Some("0") => ByteOrder::Little,
            Some("1") => ByteOrder::Big,
            Some(other) => return Err(format!("unknown byte order '{other}'")),
        };
        let header_offset = match get("header offset") {
            Some(value) => value
                .parse::<u64>()
                .map_err(|e| format!("'header offset': {e}"))?,
            None => 0,
        };
        let geotransform = get("map info").map(parse_map_info).transpose()?;

        Ok(Self {
            raster: RasterHeader {
                cols: count("samples")?,
                rows: count("lines")?,
                bands: count("bands")?,
                data_type,
                geotransform,
            },
            interleave,
            byte_order,
            header_offset,
        })
    }

    pub fn render(&self) -> String {
        let h = &self.raster;
        let code = match h.data_type {
            DataType::U8 => 1,
            DataType::I16 => 2,
            DataType::I32 => 3,
            DataType::F32 => 4,
            DataType::F64 => 5,
            DataType::U16 => 12,
            DataType::U32 => 13,
        };
        let interleave = match self.interleave {
            Interleave::Bsq => "bsq",
            Interleave::Bil => "bil",
            Interleave::Bip => "bip",
        };
        let byte_order = match self.byte_order {
            ByteOrder::Little => 0,
            ByteOrder::Big => 1,
        };
        let mut text = format!(
            "ENVI\ndescription = {{irmad output}}\nsamples = {}\nlines = {}\nbands = {}\n\
             header offset = {}\nfile type = ENVI Standard\ndata type = {code}\n\
             interleave = {interleave}\nbyte order = {byte_order}\n",
            h.cols, h.rows, h.bands, self.header_offset
        );
        match h.geotransform {
            Some(gt) if gt[2] == 0.0 && gt[4] == 0.0 => text.push_str(&format!(
                "map info = {{Arbitrary, 1, 1, {}, {}, {}, {}}}\n",
                gt[0], gt[3], gt[1], -gt[5]
            )),
            Some(_) => log::warn!("Rotated geotransform cannot be stored in an ENVI map info"),
            None => {}
        }
        text
    }

    pub fn write_for(&self, data: &Path) -> Result<(), RasterError> {
        let path = header_path(data);
        fs::write(&path, self.render()).map_err(|source| RasterError::Io { path, source })
    }

    /// Header offset plus payload, in bytes.
    pub fn file_len(&self) -> Result<u64, RasterError> {
        (self.raster.samples()? as u64)
            .checked_mul(self.raster.data_type.size() as u64)
            .and_then(|payload| payload.checked_add(self.header_offset))
            .ok_or_else(|| RasterError::InvalidHeader("raster size overflows".into()))
    }

    fn swap(&self) -> bool {
        (self.byte_order == ByteOrder::Big) == cfg!(target_endian = "little")
    }

    fn byte_offset(&self, band: usize, row: usize, col: usize) -> usize {
        let h = &self.raster;
        let sample = match self.interleave {
            Interleave::Bsq => (band * h.rows + row) * h.cols + col,
            Interleave::Bil => (row * h.bands + band) * h.cols + col,
            Interleave::Bip => (row * h.cols + col) * h.bands + band,
        };
        self.header_offset as usize + sample * h.data_type.size()
    }

    /// Decodes `out.len()` samples of one band row. Bounds are checked by the
    /// caller against [`EnviHeader::file_len`].
    pub fn decode_row(&self, bytes: &[u8], band: usize, row: usize, x0: usize, out: &mut [f64]) {
        let size = self.raster.data_type.size();
        let swap = self.swap();
        for (i, value) in out.iter_mut().enumerate() {
            let start = self.byte_offset(band, row, x0 + i);
            *value = decode(self.raster.data_type, &bytes[start..start + size], swap);
        }
    }

    /// Encodes one band in row-major order and returns how many samples were
    /// written.
    pub fn encode_band<I>(&self, bytes: &mut [u8], band: usize, values: I) -> usize
    where
        I: IntoIterator<Item = f64>,
    {
        let h = &self.raster;
        let size = h.data_type.size();
        let swap = self.swap();
        let mut written = 0usize;
        for (i, value) in values.into_iter().take(h.cols * h.rows).enumerate() {
            let start = self.byte_offset(band, i / h.cols, i % h.cols);
            encode(h.data_type, value, &mut bytes[start..start + size], swap);
            written += 1;
        }
        written
    }
}

fn parse_fields(text: &str) -> Result<HashMap<String, String>, String> {
    let mut lines = text.lines();
    if lines.next().map(str::trim) != Some("ENVI") {
        return Err("header does not start with 'ENVI'".into());
    }
    let mut fields = HashMap::new();
    while let Some(line) = lines.next() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        let mut value = value.trim().to_string();
        if value.starts_with('{') {
            while !value.contains('}') {
                let next = lines
                    .next()
                    .ok_or_else(|| format!("unterminated value for '{key}'"))?;
                value.push(' ');
                value.push_str(next.trim());
            }
            value = value
                .trim_start_matches('{')
                .trim_end_matches('}')
                .trim()
                .to_string();
        }
        fields.insert(key, value);
    }
    Ok(fields)
}

/// `{projection, ref x, ref y, easting, northing, x size, y size, ...}` with
/// a one-based reference pixel.
fn parse_map_info(value: &str) -> Result<[f64; 6], String> {
    let items: Vec<&str> = value.split(',').map(str::trim).collect();
    if items.len() < 7 {
        return Err(format!("map info needs at least 7 items, got '{value}'"));
    }
    let mut numbers = [0.0f64; 6];
    for (slot, item) in numbers.iter_mut().zip(&items[1..7]) {
        *slot = item
            .parse::<f64>()
            .map_err(|e| format!("map info item '{item}': {e}"))?;
    }
    let [ref_x, ref_y, easting, northing, x_size, y_size] = numbers;
    Ok([
        easting - (ref_x - 1.0) * x_size,
        x_size,
        0.0,
        northing + (ref_y - 1.0) * y_size,
        0.0,
        -y_size,
    ])
}

fn load<T: Pod>(raw: &[u8], swap: bool) -> T {
    if swap {
        let mut buffer = [0u8; 8];
        let reversed = &mut buffer[..raw.len()];
        reversed.copy_from_slice(raw);
        reversed.reverse();
        bytemuck::pod_read_unaligned(reversed)
    } else {
        bytemuck::pod_read_unaligned(raw)
    }
}

fn store<T: Pod>(value: T, out: &mut [u8], swap: bool) {
    out.copy_from_slice(bytemuck::bytes_of(&value));
    if swap {
        out.reverse();
    }
}

fn decode(data_type: DataType, raw: &[u8], swap: bool) -> f64 {
    match data_type {
        DataType::U8 => f64::from(raw[0]),
        DataType::U16 => f64::from(load::<u16>(raw, swap)),
        DataType::I16 => f64::from(load::<i16>(raw, swap)),
        DataType::U32 => f64::from(load::<u32>(raw, swap)),
        DataType::I32 => f64::from(load::<i32>(raw, swap)),
        DataType::F32 => f64::from(load::<f32>(raw, swap)),
        DataType::F64 => load::<f64>(raw, swap),
    }
}

/// Integer targets round and saturate.
fn encode(data_type: DataType, value: f64, out: &mut [u8], swap: bool) {
    match data_type {
        DataType::U8 => out[0] = value.round() as u8,
        DataType::U16 => store(value.round() as u16, out, swap),
        DataType::I16 => store(value.round() as i16, out, swap),
        DataType::U32 => store(value.round() as u32, out, swap),
        DataType::I32 => store(value.round() as i32, out, swap),
        DataType::F32 => store(value as f32, out, swap),
        DataType::F64 => store(value, out, swap),
    }
}
