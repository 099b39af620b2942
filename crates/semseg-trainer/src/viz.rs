//! Prediction grids: one row per sample, columns input | ground truth | prediction.

use candle_core::Tensor;
use image::{Rgb, RgbImage, imageops};

use crate::error::{Result, TrainerError};

/// Gap between tiles, in pixels.
pub const PADDING: u32 = 4;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);

/// Class colours; ids past the end wrap around.
pub const PALETTE: [[u8; 3]; 10] = [
    [0, 0, 0],
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
    [240, 50, 230],
    [210, 245, 60],
];

pub fn class_color(class: u32) -> Rgb<u8> {
    Rgb(PALETTE[class as usize % PALETTE.len()])
}

/// Render images `[B, 1, H, W]`, masks and predictions `[B, H, W]`.
pub fn render_grid(images: &Tensor, masks: &Tensor, preds: &Tensor) -> Result<RgbImage> {
    let (b, _, h, w) = images.dims4()?;
    if masks.dims() != [b, h, w] || preds.dims() != [b, h, w] {
        return Err(TrainerError::Core(semseg_core::SemsegError::Shape(format!(
            "grid needs masks and predictions of shape [{b}, {h}, {w}], got {:?} and {:?}",
            masks.dims(),
            preds.dims()
        ))));
    }

    let pixels: Vec<f32> = images.flatten_all()?.to_vec1()?;
    let masks: Vec<u32> = masks.flatten_all()?.to_vec1()?;
    let preds: Vec<u32> = preds.flatten_all()?.to_vec1()?;

    let (tile_w, tile_h) = (w as u32, h as u32);
    let width = 3 * tile_w + 4 * PADDING;
    let height = b as u32 * tile_h + (b as u32 + 1) * PADDING;
    let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);

    let area = h * w;
    for row in 0..b {
        let span = row * area..(row + 1) * area;
        let input = RgbImage::from_fn(tile_w, tile_h, |x, y| {
            let v = pixels[span.start + (y * tile_w + x) as usize];
            let g = (v.clamp(0.0, 1.0) * 255.0).round() as u8;
            Rgb([g, g, g])
        });
        let truth = colorize(&masks[span.clone()], tile_w, tile_h);
        let pred = colorize(&preds[span], tile_w, tile_h);

        let top = PADDING + row as u32 * (tile_h + PADDING);
        for (col, tile) in [input, truth, pred].iter().enumerate() {
            let left = PADDING + col as u32 * (tile_w + PADDING);
            imageops::replace(&mut canvas, tile, left.into(), top.into());
        }
    }
    Ok(canvas)
}

fn colorize(classes: &[u32], width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        class_color(classes[(y * width + x) as usize])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_grid_layout_and_colours() {
        let dev = Device::Cpu;
        let images = Tensor::ones((2, 1, 4, 6), candle_core::DType::F32, &dev).unwrap();
        let masks = Tensor::ones((2, 4, 6), candle_core::DType::U32, &dev).unwrap();
        let preds = Tensor::zeros((2, 4, 6), candle_core::DType::U32, &dev).unwrap();

        let grid = render_grid(&images, &masks, &preds).unwrap();
        assert_eq!(grid.dimensions(), (3 * 6 + 4 * PADDING, 2 * 4 + 3 * PADDING));

        let y = PADDING + 4 + PADDING + 1; // inside the second row
        assert_eq!(*grid.get_pixel(PADDING, y), Rgb([255, 255, 255]));
        assert_eq!(*grid.get_pixel(2 * PADDING + 6, y), class_color(1));
        assert_eq!(*grid.get_pixel(3 * PADDING + 12, y), class_color(0));
        assert_eq!(*grid.get_pixel(0, 0), BACKGROUND);
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        let dev = Device::Cpu;
        let images = Tensor::zeros((1, 1, 4, 4), candle_core::DType::F32, &dev).unwrap();
        let masks = Tensor::zeros((1, 4, 4), candle_core::DType::U32, &dev).unwrap();
        let preds = Tensor::zeros((2, 4, 4), candle_core::DType::U32, &dev).unwrap();
        assert!(render_grid(&images, &masks, &preds).is_err());
    }

    #[test]
    fn test_palette_wraps() {
        assert_eq!(class_color(0), class_color(PALETTE.len() as u32));
    }
}
