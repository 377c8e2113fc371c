//! 图像读写. 按文件扩展名分派到 tif, npy 或 nifti 解码器.
//!
//! 读出的数组 **不含** 通道维度, 由调用者 (例如 `DataReader`) 决定是否补上.
//! nifti 数据按惯例以 `[x, y, z]` 存储, 读出时会反转为 `[z, y, x]`,
//! 体素间距也按同样的顺序反转; 写入时再反转回去.

use std::path::Path;

use image::{DynamicImage, GenericImageView, ImageBuffer, Luma};
use ndarray::{ArrayD, ArrayViewD, Axis, Ix2, IxDyn};
use ndarray_npy::{ReadNpyError, ReadableElement};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use num::cast::AsPrimitive;

use crate::{SegError, SegResult};

/// 体素间距. 长度等于空间维度个数; 格式本身不记录间距时为空.
pub type Spacing = Vec<f64>;

/// 图像读写器.
///
/// 增强管线只依赖这个接口, 不依赖具体的解码器.
pub trait ImageIo: Send + Sync {
    /// 读取 `path` 处的图像, 返回数组与体素间距.
    fn read(&self, path: &Path) -> SegResult<(ArrayD<f32>, Spacing)>;

    /// 将 `array` 写入 `path`. 格式不支持间距时忽略 `spacing`.
    fn write(&self, path: &Path, array: &ArrayViewD<f32>, spacing: &[f64]) -> SegResult<()>;

    /// 读取标签. 取值四舍五入后截断到 `u8` 范围.
    fn read_mask(&self, path: &Path) -> SegResult<(ArrayD<u8>, Spacing)> {
        let (array, spacing) = self.read(path)?;
        Ok((array.mapv(|v| v.round().clamp(0.0, u8::MAX as f32) as u8), spacing))
    }
}

/// 文件格式.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    /// 二维 tif (单通道灰度).
    Tif,
    /// numpy 数组.
    Npy,
    /// nifti 等体数据格式.
    Nifti,
}

impl Format {
    /// 根据扩展名判断格式. 不认识的扩展名一律视为 nifti.
    pub fn of(path: &Path) -> Self {
        match path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .as_deref()
        {
            Some("tif" | "tiff") => Format::Tif,
            Some("npy") => Format::Npy,
            _ => Format::Nifti,
        }
    }
}

/// 按扩展名自适应的读写器.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdaptiveIo;

impl ImageIo for AdaptiveIo {
    fn read(&self, path: &Path) -> SegResult<(ArrayD<f32>, Spacing)> {
        match Format::of(path) {
            Format::Tif => Ok((read_tif(path)?, Vec::new())),
            Format::Npy => Ok((read_npy_any(path)?, Vec::new())),
            Format::Nifti => read_nifti(path),
        }
    }

    fn write(&self, path: &Path, array: &ArrayViewD<f32>, spacing: &[f64]) -> SegResult<()> {
        match Format::of(path) {
            Format::Tif => write_tif(path, array),
            Format::Npy => Ok(ndarray_npy::write_npy(path, array)?),
            Format::Nifti => write_nifti(path, array, spacing),
        }
    }
}

/// 保证数组带有通道轴.
///
/// 恰好有 `dim` 个维度时在最前面补上长度为 1 的通道轴; 有 `dim + 1` 个维度时原样返回;
/// 其余情况返回 [`SegError::UnsupportedFormat`].
pub fn ensure_channel_axis<T>(path: &Path, array: ArrayD<T>, dim: usize) -> SegResult<ArrayD<T>> {
    match array.ndim() {
        n if n == dim => Ok(array.insert_axis(Axis(0))),
        n if n == dim + 1 => Ok(array),
        n => Err(SegError::UnsupportedFormat {
            path: path.to_owned(),
            reason: format!("{n}-d array, expected {dim} spatial axes"),
        }),
    }
}

/// 读取 `T` 类型的 npy 数组并转换为 `f32`.
fn read_npy_as<T>(path: &Path) -> Result<ArrayD<f32>, ReadNpyError>
where
    T: ReadableElement + AsPrimitive<f32>,
{
    let a: ArrayD<T> = ndarray_npy::read_npy(path)?;
    Ok(a.mapv(|v| v.as_()))
}

/// 依次尝试常见的数据类型读取 npy 文件.
fn read_npy_any(path: &Path) -> SegResult<ArrayD<f32>> {
    type Reader = fn(&Path) -> Result<ArrayD<f32>, ReadNpyError>;
    const READERS: [Reader; 8] = [
        read_npy_as::<f32>,
        read_npy_as::<f64>,
        read_npy_as::<u8>,
        read_npy_as::<i8>,
        read_npy_as::<u16>,
        read_npy_as::<i16>,
        read_npy_as::<i32>,
        read_npy_as::<i64>,
    ];
    for reader in READERS {
        match reader(path) {
            Ok(a) => return Ok(a),
            Err(ReadNpyError::WrongDescriptor(_)) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(SegError::UnsupportedFormat {
        path: path.to_owned(),
        reason: "unsupported npy dtype".to_owned(),
    })
}

/// 读取二维灰度 tif. 8 位和 16 位图像保留原始取值, 其余格式先转为 16 位灰度.
fn read_tif(path: &Path) -> SegResult<ArrayD<f32>> {
    let img = image::open(path)?;
    let (w, h) = (img.width() as usize, img.height() as usize);
    let data: Vec<f32> = match img {
        DynamicImage::ImageLuma8(buf) => buf.into_raw().into_iter().map(f32::from).collect(),
        DynamicImage::ImageLuma16(buf) => buf.into_raw().into_iter().map(f32::from).collect(),
        other => other.to_luma16().into_raw().into_iter().map(f32::from).collect(),
    };
    ArrayD::from_shape_vec(IxDyn(&[h, w]), data).map_err(|e| SegError::UnsupportedFormat {
        path: path.to_owned(),
        reason: e.to_string(),
    })
}

/// 写入二维 16 位灰度 tif. 取值四舍五入并截断到 `u16` 范围.
fn write_tif(path: &Path, array: &ArrayViewD<f32>) -> SegResult<()> {
    let plane = array
        .view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| SegError::UnsupportedFormat {
            path: path.to_owned(),
            reason: format!("tif expects a 2d array, got shape {:?}", array.shape()),
        })?;
    let (h, w) = plane.dim();
    let buf: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_fn(w as u32, h as u32, |x, y| {
        let v = plane[(y as usize, x as usize)];
        Luma([v.round().clamp(0.0, u16::MAX as f32) as u16])
    });
    buf.save(path)?;
    Ok(())
}

/// 读取 nifti 体数据, 轴顺序与间距都反转为 `[z, y, x]`.
fn read_nifti(path: &Path) -> SegResult<(ArrayD<f32>, Spacing)> {
    let obj = ReaderOptions::new().read_file(path)?;
    let header = obj.header();
    let ndim = (header.dim[0] as usize).clamp(1, 7);
    let spacing: Spacing = header.pixdim[1..=ndim]
        .iter()
        .rev()
        .map(|&p| p as f64)
        .collect();

    let data = obj.into_volume().into_ndarray::<f32>()?.reversed_axes();
    let data = if data.is_standard_layout() {
        data
    } else {
        data.as_standard_layout().into_owned()
    };
    Ok((data, spacing))
}

/// 写入 nifti. `array` 与 `spacing` 都按 `[z, y, x]` 顺序给出.
fn write_nifti(path: &Path, array: &ArrayViewD<f32>, spacing: &[f64]) -> SegResult<()> {
    let mut header = NiftiHeader::default();
    for (slot, &s) in header.pixdim[1..].iter_mut().zip(spacing.iter().rev()) {
        *slot = s as f32;
    }
    let data = array.view().reversed_axes();
    WriterOptions::new(path)
        .reference_header(&header)
        .write_nifti(&data)?;
    Ok(())
}
