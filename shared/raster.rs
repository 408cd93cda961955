//! Multiband raster access for the change-detection drivers.
//!
//! Two on-disk layouts are understood, chosen by file extension:
//!
//! - `.tif` / `.tiff`: GeoTIFF, decoded with the `tiff` crate. Bands come
//!   either from the samples of one pixel-interleaved image or from
//!   successive full-resolution pages. The georeferencing is taken from the
//!   model transformation tag or the tie point and pixel scale tags.
//! - anything else: an ENVI raw image with a `.hdr` text header, memory
//!   mapped and decoded on demand (`bsq`, `bil` or `bip`, either byte
//!   order).
//!
//! Samples are always handed out as `f64`.

use memmap2::{Mmap, MmapMut};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::envi::EnviHeader;
use crate::geotiff;

#[derive(Debug, Error)]
pub enum RasterError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("TIFF error on {path}: {source}")]
    Tiff {
        path: PathBuf,
        #[source]
        source: tiff::TiffError,
    },
    #[error("failed to parse raster header {path}: {message}")]
    HeaderParse { path: PathBuf, message: String },
    #[error("invalid raster header: {0}")]
    InvalidHeader(String),
    #[error("unsupported raster layout in {path}: {message}")]
    Unsupported { path: PathBuf, message: String },
    #[error("{path} holds {found} bytes but its header describes {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        found: u64,
    },
    #[error("{0}")]
    OutOfBounds(String),
}

/// Storage type of the samples on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DataType {
    U8,
    U16,
    I16,
    U32,
    I32,
    F32,
    F64,
}

impl DataType {
    pub fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// Container a raster is read from or written to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RasterFormat {
    GeoTiff,
    Envi,
}

impl RasterFormat {
    pub fn from_path(path: &Path) -> Self {
        let is_tiff = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("tif") || ext.eq_ignore_ascii_case("tiff"));
        if is_tiff { Self::GeoTiff } else { Self::Envi }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RasterHeader {
    pub cols: usize,
    pub rows: usize,
    pub bands: usize,
    pub data_type: DataType,
    /// GDAL-ordered affine transform.
    pub geotransform: Option<[f64; 6]>,
}

impl RasterHeader {
    pub fn validate(&self) -> Result<(), RasterError> {
        if self.cols == 0 || self.rows == 0 || self.bands == 0 {
            return Err(RasterError::InvalidHeader(format!(
                "dimensions must be positive, got {} cols, {} rows, {} bands",
                self.cols, self.rows, self.bands
            )));
        }
        self.samples()?;
        Ok(())
    }

    pub fn band_pixels(&self) -> Result<usize, RasterError> {
        self.cols
            .checked_mul(self.rows)
            .ok_or_else(|| RasterError::InvalidHeader("raster size overflows".into()))
    }

    /// Total sample count over every band.
    pub fn samples(&self) -> Result<usize, RasterError> {
        self.band_pixels()?
            .checked_mul(self.bands)
            .ok_or_else(|| RasterError::InvalidHeader("raster size overflows".into()))
    }
}

/// Spatial subset of a raster, in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub x0: usize,
    pub y0: usize,
    pub cols: usize,
    pub rows: usize,
}

impl Window {
    pub fn full(header: &RasterHeader) -> Self {
        Self {
            x0: 0,
            y0: 0,
            cols: header.cols,
            rows: header.rows,
        }
    }

    pub fn pixels(&self) -> Result<usize, RasterError> {
        self.cols.checked_mul(self.rows).ok_or_else(|| {
            RasterError::OutOfBounds(format!(
                "window of {}x{} pixels is too large",
                self.cols, self.rows
            ))
        })
    }

    /// Same extent placed at another origin.
    pub fn at(&self, x0: usize, y0: usize) -> Self {
        Self { x0, y0, ..*self }
    }

    pub fn check_within(&self, header: &RasterHeader) -> Result<(), RasterError> {
        if self.cols == 0 || self.rows == 0 {
            return Err(RasterError::OutOfBounds("window must not be empty".into()));
        }
        let x_end = self.x0.checked_add(self.cols);
        let y_end = self.y0.checked_add(self.rows);
        let inside = x_end.is_some_and(|end| end <= header.cols)
            && y_end.is_some_and(|end| end <= header.rows);
        if !inside {
            return Err(RasterError::OutOfBounds(format!(
                "window {}x{} at ({}, {}) exceeds raster of {}x{}",
                self.cols, self.rows, self.x0, self.y0, header.cols, header.rows
            )));
        }
        Ok(())
    }

    /// Geotransform of the window: the origin moves by `x0` columns and `y0`
    /// rows.
    pub fn geotransform(&self, parent: Option<[f64; 6]>) -> Option<[f64; 6]> {
        parent.map(|mut gt| {
            gt[0] += self.x0 as f64 * gt[1] + self.y0 as f64 * gt[2];
            gt[3] += self.x0 as f64 * gt[4] + self.y0 as f64 * gt[5];
            gt
        })
    }
}

/// Zero-based band indices chosen from a raster.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BandSelection {
    indices: Vec<usize>,
}

impl BandSelection {
    pub fn all(bands: usize) -> Self {
        Self {
            indices: (0..bands).collect(),
        }
    }

    /// Builds a selection from one-based band positions.
    pub fn from_positions(positions: &[usize], available: usize) -> Result<Self, RasterError> {
        if positions.is_empty() {
            return Err(RasterError::OutOfBounds("band selection is empty".into()));
        }
        let indices = positions
            .iter()
            .map(|&pos| {
                if pos == 0 || pos > available {
                    Err(RasterError::OutOfBounds(format!(
                        "band position {pos} is outside 1..={available}"
                    )))
                } else {
                    Ok(pos - 1)
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { indices })
    }

    pub fn resolve(positions: Option<&[usize]>, available: usize) -> Result<Self, RasterError> {
        match positions {
            Some(positions) => Self::from_positions(positions, available),
            None => Ok(Self::all(available)),
        }
    }

    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

enum Samples {
    /// Memory-mapped ENVI payload, decoded on every read.
    Mapped { map: Mmap, layout: EnviHeader },
    /// Band-sequential samples decoded up front.
    Decoded(Vec<f64>),
}

/// Read-only raster opened from disk.
pub struct Raster {
    path: PathBuf,
    header: RasterHeader,
    samples: Samples,
}

impl Raster {
    pub fn open(path: &Path) -> Result<Self, RasterError> {
        let raster = match RasterFormat::from_path(path) {
            RasterFormat::GeoTiff => {
                let (header, values) = geotiff::read(path)?;
                Self {
                    path: path.to_path_buf(),
                    header,
                    samples: Samples::Decoded(values),
                }
            }
            RasterFormat::Envi => Self::open_envi(path)?,
        };
        let h = &raster.header;
        log::debug!(
            "Opened {} ({}x{}, {} bands, {:?})",
            path.display(),
            h.cols,
            h.rows,
            h.bands,
            h.data_type
        );
        Ok(raster)
    }

    fn open_envi(path: &Path) -> Result<Self, RasterError> {
        let layout = EnviHeader::read_for(path)?;
        let io_err = |source| RasterError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::open(path).map_err(io_err)?;
        let expected = layout.file_len()?;
        let found = file.metadata().map_err(io_err)?.len();
        if found < expected {
            return Err(RasterError::SizeMismatch {
                path: path.to_path_buf(),
                expected,
                found,
            });
        }
        let map = unsafe { Mmap::map(&file) }.map_err(io_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            header: layout.raster.clone(),
            samples: Samples::Mapped { map, layout },
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &RasterHeader {
        &self.header
    }

    /// Reads `out.len()` samples of one band row starting at column `x0`.
    pub fn read_row(
        &self,
        band: usize,
        row: usize,
        x0: usize,
        out: &mut [f64],
    ) -> Result<(), RasterError> {
        let h = &self.header;
        let past_end = x0.checked_add(out.len()).is_none_or(|end| end > h.cols);
        if band >= h.bands || row >= h.rows || past_end {
            return Err(RasterError::OutOfBounds(format!(
                "read of {} samples at band {band}, row {row}, column {x0} is outside {}",
                out.len(),
                self.path.display()
            )));
        }
        match &self.samples {
            Samples::Mapped { map, layout } => layout.decode_row(map, band, row, x0, out),
            Samples::Decoded(values) => {
                let start = (band * h.rows + row) * h.cols + x0;
                out.copy_from_slice(&values[start..start + out.len()]);
            }
        }
        Ok(())
    }

    /// Reads one band over a window, row-major.
    pub fn read_window(&self, band: usize, window: &Window) -> Result<Vec<f64>, RasterError> {
        window.check_within(&self.header)?;
        let mut values = vec![0.0; window.pixels()?];
        for (row, chunk) in values.chunks_exact_mut(window.cols).enumerate() {
            self.read_row(band, window.y0 + row, window.x0, chunk)?;
        }
        Ok(values)
    }
}

enum Destination {
    Mapped { map: MmapMut, layout: EnviHeader },
    /// Bands held until `finish` encodes the GeoTIFF.
    Buffered(Vec<f64>),
}

/// Output raster. ENVI outputs are memory mapped and their header is written
/// on creation; GeoTIFF outputs are encoded by [`RasterWriter::finish`].
pub struct RasterWriter {
    path: PathBuf,
    header: RasterHeader,
    destination: Destination,
}

impl RasterWriter {
    pub fn create(path: &Path, header: RasterHeader) -> Result<Self, RasterError> {
        header.validate()?;
        let destination = match RasterFormat::from_path(path) {
            RasterFormat::GeoTiff => Destination::Buffered(vec![0.0; header.samples()?]),
            RasterFormat::Envi => {
                let layout = EnviHeader::for_output(header.clone());
                let io_err = |source| RasterError::Io {
                    path: path.to_path_buf(),
                    source,
                };
                let file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(io_err)?;
                file.set_len(layout.file_len()?).map_err(io_err)?;
                let map = unsafe { MmapMut::map_mut(&file) }.map_err(io_err)?;
                layout.write_for(path)?;
                Destination::Mapped { map, layout }
            }
        };
        Ok(Self {
            path: path.to_path_buf(),
            header,
            destination,
        })
    }

    pub fn header(&self) -> &RasterHeader {
        &self.header
    }

    /// Writes a whole band in row-major order.
    pub fn write_band<I>(&mut self, band: usize, values: I) -> Result<(), RasterError>
    where
        I: IntoIterator<Item = f64>,
    {
        let h = &self.header;
        if band >= h.bands {
            return Err(RasterError::OutOfBounds(format!(
                "band {band} is outside {} bands of {}",
                h.bands,
                self.path.display()
            )));
        }
        let pixels = h.band_pixels()?;
        let written = match &mut self.destination {
            Destination::Mapped { map, layout } => layout.encode_band(map, band, values),
            Destination::Buffered(samples) => {
                let slots = &mut samples[band * pixels..(band + 1) * pixels];
                slots.iter_mut().zip(values).fold(0, |count, (slot, value)| {
                    *slot = value;
                    count + 1
                })
            }
        };
        if written != pixels {
            return Err(RasterError::OutOfBounds(format!(
                "band {band} of {} received {written} of {pixels} samples",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn finish(self) -> Result<(), RasterError> {
        match self.destination {
            Destination::Mapped { map, .. } => map.flush().map_err(|source| RasterError::Io {
                path: self.path.clone(),
                source,
            }),
            Destination::Buffered(samples) => geotiff::write(&self.path, &self.header, &samples),
        }
    }
}
