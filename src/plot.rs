//! Charts of a finished run: the loss history and a grid of generated digits

use std::{error::Error, path::Path};

use plotters::prelude::*;

use crate::{
    gan::Generator,
    tensor::{Tensor, TensorError},
};

/// Extent of the latent grid used when rendering samples after training
pub const DEFAULT_EXTENT: f32 = 0.5;

/// Plots the per-epoch generator loss as a line chart
pub fn plot_history(losses: &[f32], path: &Path) -> Result<(), Box<dyn Error>> {
    let root_area = BitMapBackend::new(path, (640, 480)).into_drawing_area();
    root_area.fill(&WHITE)?;

    let finite = losses.iter().copied().filter(|l| l.is_finite());
    let (min, max) = finite.fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), l| {
        (lo.min(l), hi.max(l))
    });
    let (min, max) = if min <= max { (min, max) } else { (0.0, 1.0) };
    let margin = ((max - min) * 0.05).max(1e-3);

    let mut chart = ChartBuilder::on(&root_area)
        .caption("Generator loss", ("sans-serif", 40))
        .margin(20)
        .x_label_area_size(30)
        .y_label_area_size(50)
        .build_cartesian_2d(1usize..losses.len().max(2), (min - margin)..(max + margin))?;

    chart
        .configure_mesh()
        .x_desc("epoch")
        .y_desc("loss")
        .draw()?;

    chart.draw_series(LineSeries::new(
        losses
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .map(|(i, l)| (i + 1, *l)),
        &BLUE,
    ))?;

    root_area.present()?;
    log::info!("Loss history plot saved to '{}'.", path.display());
    Ok(())
}

/// Latent vectors on a square grid, `(2n + 1)^2` rows of `[latent_dim]`.
/// The first two components step through `extent * i / n` and `extent * j / n` for `i, j` in
/// `-n..=n` (row major in `i`), every other component is zero.
pub fn latent_grid(n: usize, latent_dim: usize, extent: f32) -> Result<Tensor, TensorError> {
    let steps = -(n as i64)..=n as i64;
    let coord = |k: i64| match n {
        0 => 0.0,
        n => extent * k as f32 / n as f32,
    };
    let mut data = Vec::with_capacity((2 * n + 1).pow(2) * latent_dim);
    for i in steps.clone() {
        for j in steps.clone() {
            let mut point = vec![0.0; latent_dim];
            for (slot, value) in point.iter_mut().zip([coord(i), coord(j)]) {
                *slot = value;
            }
            data.extend(point);
        }
    }
    Tensor::new(data, &[(2 * n + 1).pow(2), latent_dim])
}

/// Renders `generator` over [`latent_grid`] as a `(2n + 1) x (2n + 1)` sheet of grayscale digits
pub fn plot_sample_grid(
    generator: &Generator,
    n: usize,
    extent: f32,
    path: &Path,
) -> Result<(), Box<dyn Error>> {
    let latent_dim = generator.architecture().latent_dim;
    let images = generator.generate(&latent_grid(n, latent_dim, extent)?)?;
    let side = generator.architecture().image_side();
    let cells = 2 * n + 1;
    let cell_px = 4 * side as u32;

    let root_area =
        BitMapBackend::new(path, (cells as u32 * cell_px, cells as u32 * cell_px)).into_drawing_area();
    root_area.fill(&BLACK)?;

    let data = images.data();
    for (cell, area) in root_area.split_evenly((cells, cells)).iter().enumerate() {
        let pixels = &data[cell * side * side..(cell + 1) * side * side];
        let (width, height) = area.dim_in_pixel();
        let (px_w, px_h) = (width as i32 / side as i32, height as i32 / side as i32);
        for (k, &value) in pixels.iter().enumerate() {
            let (row, col) = ((k / side) as i32, (k % side) as i32);
            let shade = (value.clamp(0.0, 1.0) * 255.0).round() as u8;
            area.draw(&Rectangle::new(
                [
                    (col * px_w, row * px_h),
                    ((col + 1) * px_w, (row + 1) * px_h),
                ],
                RGBColor(shade, shade, shade).filled(),
            ))?;
        }
    }

    root_area.present()?;
    log::info!("Sample grid saved to '{}'.", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_pcg::Pcg64Mcg;

    use super::*;
    use crate::{assert_eq_float, gan::tests::small_architecture};

    #[test]
    fn test_latent_grid() {
        let grid = latent_grid(2, 2, 0.5).unwrap();
        assert_eq!(grid.shape(), vec![25, 2]);
        let data = grid.to_vec();
        assert_eq!(&data[..2], &[-0.5, -0.5]);
        assert_eq!(&data[2..4], &[-0.5, -0.25]);
        // centre
        assert_eq!(&data[24..26], &[0.0, 0.0]);
        assert_eq!(&data[48..], &[0.5, 0.5]);
    }

    #[test]
    fn test_latent_grid_pads_extra_dimensions() {
        let grid = latent_grid(1, 4, 1.0).unwrap();
        assert_eq!(grid.shape(), vec![9, 4]);
        let data = grid.to_vec();
        assert_eq!(&data[..4], &[-1.0, -1.0, 0.0, 0.0]);

        let single = latent_grid(0, 3, 0.5).unwrap();
        assert_eq!(single.to_vec(), vec![0.0; 3]);

        let one_dim = latent_grid(1, 1, 2.0).unwrap();
        assert_eq!(one_dim.shape(), vec![9, 1]);
        assert_eq_float!(one_dim.to_vec()[0], -2.0);
    }

    #[test]
    fn test_sample_grid_is_written() {
        let dir = std::env::temp_dir().join(format!("digit-gan-plot-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let mut rng = Pcg64Mcg::seed_from_u64(0);
        let generator = Generator::new(small_architecture(), &mut rng).unwrap();
        let grid_path = dir.join("samples.png");
        plot_sample_grid(&generator, 1, DEFAULT_EXTENT, &grid_path).unwrap();
        assert!(grid_path.is_file());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
