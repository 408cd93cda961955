//! GeoTIFF reading and writing through the `tiff` crate.
//!
//! Bands are read from the samples of a pixel-interleaved image and from any
//! further full-resolution pages; reduced-resolution pages and masks are
//! skipped. Outputs store one single-sample page per band, each carrying the
//! georeferencing tags.

use std::fs::{self, File};
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::Path;
use tiff::TiffResult;
use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::{self, ColorType};
use tiff::encoder::{TiffEncoder, TiffValue};
use tiff::tags::Tag;

use crate::raster::{DataType, RasterError, RasterHeader};

/// GTModelTypeGeoKey = projected, GTRasterTypeGeoKey = pixel is area.
const GEO_KEYS: [u16; 12] = [1, 1, 0, 2, 1024, 0, 1, 1, 1025, 0, 1, 1];

/// Decodes every band of a GeoTIFF into band-sequential `f64` samples.
pub fn read(path: &Path) -> Result<(RasterHeader, Vec<f64>), RasterError> {
    let tiff_err = |source| RasterError::Tiff {
        path: path.to_path_buf(),
        source,
    };
    let unsupported = |message: String| RasterError::Unsupported {
        path: path.to_path_buf(),
        message,
    };
    let file = File::open(path).map_err(|source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut decoder = Decoder::new(BufReader::new(file))
        .map_err(tiff_err)?
        .with_limits(Limits::unlimited());

    let (width, height) = decoder.dimensions().map_err(tiff_err)?;
    let cols = width as usize;
    let rows = height as usize;
    let pixels = cols
        .checked_mul(rows)
        .filter(|&n| n > 0)
        .ok_or_else(|| unsupported(format!("image of {cols}x{rows} pixels")))?;
    let geotransform = read_geotransform(&mut decoder);

    let (data_type, first) = widen(decoder.read_image().map_err(tiff_err)?)
        .ok_or_else(|| unsupported("sample format is not supported".into()))?;
    let mut values = Vec::with_capacity(first.len());
    let mut bands = append_bands(&mut values, &first, pixels)
        .ok_or_else(|| unsupported("samples do not fill whole pixels".into()))?;

    while decoder.more_images() {
        decoder.next_image().map_err(tiff_err)?;
        let dimensions = decoder.dimensions().map_err(tiff_err)?;
        let subfile_type = decoder.get_tag_u32(Tag::NewSubfileType).unwrap_or(0);
        if dimensions != (width, height) || subfile_type != 0 {
            log::debug!(
                "Skipping {}x{} page of {} (subfile type {subfile_type})",
                dimensions.0,
                dimensions.1,
                path.display()
            );
            continue;
        }
        let (page_type, page) = widen(decoder.read_image().map_err(tiff_err)?)
            .ok_or_else(|| unsupported("sample format is not supported".into()))?;
        if page_type != data_type {
            log::debug!(
                "Page of {} stores {page_type:?} samples after {data_type:?}",
                path.display()
            );
        }
        bands += append_bands(&mut values, &page, pixels)
            .ok_or_else(|| unsupported("samples do not fill whole pixels".into()))?;
    }

    let header = RasterHeader {
        cols,
        rows,
        bands,
        data_type,
        geotransform,
    };
    header.validate()?;
    Ok((header, values))
}

/// Encodes band-sequential samples as a GeoTIFF with one page per band.
pub fn write(path: &Path, header: &RasterHeader, samples: &[f64]) -> Result<(), RasterError> {
    let tiff_err = |source| RasterError::Tiff {
        path: path.to_path_buf(),
        source,
    };
    let (Ok(cols), Ok(rows)) = (u32::try_from(header.cols), u32::try_from(header.rows)) else {
        return Err(RasterError::Unsupported {
            path: path.to_path_buf(),
            message: format!("{}x{} pixels exceed the TIFF limits", header.cols, header.rows),
        });
    };
    let pixels = header.band_pixels()?;

    let mut buffer = Vec::new();
    let mut encoder = TiffEncoder::new(Cursor::new(&mut buffer)).map_err(tiff_err)?;
    let geotransform = header.geotransform;
    for band in samples.chunks_exact(pixels) {
        match header.data_type {
            DataType::U8 => write_page::<_, colortype::Gray8>(
                &mut encoder,
                (cols, rows),
                geotransform,
                &narrow(band, |v| v.round() as u8),
            ),
            DataType::U16 => write_page::<_, colortype::Gray16>(
                &mut encoder,
                (cols, rows),
                geotransform,
                &narrow(band, |v| v.round() as u16),
            ),
            DataType::I16 => write_page::<_, colortype::GrayI16>(
                &mut encoder,
                (cols, rows),
                geotransform,
                &narrow(band, |v| v.round() as i16),
            ),
            DataType::U32 => write_page::<_, colortype::Gray32>(
                &mut encoder,
                (cols, rows),
                geotransform,
                &narrow(band, |v| v.round() as u32),
            ),
            DataType::I32 => write_page::<_, colortype::GrayI32>(
                &mut encoder,
                (cols, rows),
                geotransform,
                &narrow(band, |v| v.round() as i32),
            ),
            DataType::F32 => write_page::<_, colortype::Gray32Float>(
                &mut encoder,
                (cols, rows),
                geotransform,
                &narrow(band, |v| v as f32),
            ),
            DataType::F64 => write_page::<_, colortype::Gray64Float>(
                &mut encoder,
                (cols, rows),
                geotransform,
                band,
            ),
        }
        .map_err(tiff_err)?;
    }
    drop(encoder);

    fs::write(path, buffer).map_err(|source| RasterError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn write_page<W, C>(
    encoder: &mut TiffEncoder<W>,
    (cols, rows): (u32, u32),
    geotransform: Option<[f64; 6]>,
    data: &[C::Inner],
) -> TiffResult<()>
where
    W: Write + Seek,
    C: ColorType,
    [C::Inner]: TiffValue,
{
    let mut image = encoder.new_image::<C>(cols, rows)?;
    if let Some(gt) = geotransform {
        let directory = image.encoder();
        if gt[2] == 0.0 && gt[4] == 0.0 {
            directory.write_tag(Tag::ModelPixelScaleTag, &[gt[1], -gt[5], 0.0][..])?;
            directory.write_tag(Tag::ModelTiepointTag, &[0.0, 0.0, 0.0, gt[0], gt[3], 0.0][..])?;
        } else {
            let matrix = [
                gt[1], gt[2], 0.0, gt[0], gt[4], gt[5], 0.0, gt[3], 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
                0.0, 1.0,
            ];
            directory.write_tag(Tag::ModelTransformationTag, &matrix[..])?;
        }
        directory.write_tag(Tag::GeoKeyDirectoryTag, &GEO_KEYS[..])?;
    }
    image.write_data(data)
}

fn narrow<T>(band: &[f64], cast: impl Fn(f64) -> T) -> Vec<T> {
    band.iter().map(|&v| cast(v)).collect()
}

/// Affine transform from the model transformation tag, or from the first tie
/// point and the pixel scale.
fn read_geotransform<R: Read + Seek>(decoder: &mut Decoder<R>) -> Option<[f64; 6]> {
    if let Ok(m) = decoder.get_tag_f64_vec(Tag::ModelTransformationTag) {
        if m.len() >= 8 {
            return Some([m[3], m[0], m[1], m[7], m[4], m[5]]);
        }
    }
    let scale = decoder.get_tag_f64_vec(Tag::ModelPixelScaleTag).ok()?;
    let tiepoint = decoder.get_tag_f64_vec(Tag::ModelTiepointTag).ok()?;
    if scale.len() < 2 || tiepoint.len() < 6 {
        return None;
    }
    Some([
        tiepoint[3] - tiepoint[0] * scale[0],
        scale[0],
        0.0,
        tiepoint[4] + tiepoint[1] * scale[1],
        0.0,
        -scale[1],
    ])
}

fn widen(result: DecodingResult) -> Option<(DataType, Vec<f64>)> {
    let widened = match result {
        DecodingResult::U8(buf) => (DataType::U8, buf.into_iter().map(f64::from).collect()),
        DecodingResult::U16(buf) => (DataType::U16, buf.into_iter().map(f64::from).collect()),
        DecodingResult::I8(buf) => (DataType::I16, buf.into_iter().map(f64::from).collect()),
        DecodingResult::I16(buf) => (DataType::I16, buf.into_iter().map(f64::from).collect()),
        DecodingResult::U32(buf) => (DataType::U32, buf.into_iter().map(f64::from).collect()),
        DecodingResult::I32(buf) => (DataType::I32, buf.into_iter().map(f64::from).collect()),
        DecodingResult::F32(buf) => (DataType::F32, buf.into_iter().map(f64::from).collect()),
        DecodingResult::F64(buf) => (DataType::F64, buf),
        _ => return None,
    };
    Some(widened)
}

/// Appends the pixel-interleaved `samples` band by band and returns how many
/// bands they held.
fn append_bands(values: &mut Vec<f64>, samples: &[f64], pixels: usize) -> Option<usize> {
    if samples.is_empty() || samples.len() % pixels != 0 {
        return None;
    }
    let per_pixel = samples.len() / pixels;
    for band in 0..per_pixel {
        values.extend(samples.iter().skip(band).step_by(per_pixel).copied());
    }
    Some(per_pixel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{Raster, Window};

    #[test]
    fn interleaved_samples_become_bands() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rgb.tif");
        let data: Vec<u16> = (0..18).collect();
        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder
            .write_image::<colortype::RGB16>(3, 2, &data)
            .unwrap();

        let raster = Raster::open(&path).unwrap();
        let header = raster.header();
        assert_eq!((header.cols, header.rows, header.bands), (3, 2, 3));
        assert_eq!(header.data_type, DataType::U16);
        assert_eq!(header.geotransform, None);
        let full = Window::full(header);
        assert_eq!(
            raster.read_window(1, &full).unwrap(),
            vec![1.0, 4.0, 7.0, 10.0, 13.0, 16.0]
        );
    }

    #[test]
    fn overview_pages_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pyramid.tif");
        let mut encoder = TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder
            .write_image::<colortype::Gray32Float>(4, 2, &[1.0f32; 8])
            .unwrap();
        encoder
            .write_image::<colortype::Gray32Float>(2, 1, &[9.0f32; 2])
            .unwrap();
        encoder
            .write_image::<colortype::Gray32Float>(4, 2, &[2.0f32; 8])
            .unwrap();

        let raster = Raster::open(&path).unwrap();
        assert_eq!(raster.header().bands, 2);
        let full = Window::full(raster.header());
        assert_eq!(raster.read_window(1, &full).unwrap(), vec![2.0; 8]);
    }

    #[test]
    fn pages_carry_the_geotransform() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.tif");
        let header = RasterHeader {
            cols: 2,
            rows: 2,
            bands: 2,
            data_type: DataType::I16,
            geotransform: Some([500000.0, 10.0, 0.0, 4000000.0, 0.0, -10.0]),
        };
        write(&path, &header, &[1.0, -2.0, 3.0, -4.0, 10.0, 20.0, 30.0, 40.0]).unwrap();

        let (read_back, values) = read(&path).unwrap();
        assert_eq!(read_back, header);
        assert_eq!(values, vec![1.0, -2.0, 3.0, -4.0, 10.0, 20.0, 30.0, 40.0]);
    }

    #[test]
    fn rotated_geotransform_uses_the_model_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotated.tif");
        let header = RasterHeader {
            cols: 2,
            rows: 1,
            bands: 1,
            data_type: DataType::F64,
            geotransform: Some([100.0, 2.0, 0.5, 200.0, 0.25, -2.0]),
        };
        write(&path, &header, &[0.5, 1.5]).unwrap();
        let (read_back, _) = read(&path).unwrap();
        assert_eq!(read_back.geotransform, header.geotransform);
    }
}
