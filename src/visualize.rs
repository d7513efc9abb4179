//! Dataset overview plots.

use camino::Utf8Path;

use crate::{
    dataset::DatasetStats,
    training_progress::{padded_range, PlotError},
};

/// Bins of the message length histogram.
pub const LENGTH_BINS: usize = 50;
/// Bins of the word count histogram.
pub const WORD_COUNT_BINS: usize = 30;

/// Equal-width histogram bins: `(start, end, count)`.
pub fn histogram(values: &[usize], bins: usize) -> Vec<(f64, f64, u32)> {
    let (Some(&min), Some(&max)) = (values.iter().min(), values.iter().max()) else {
        return Vec::new();
    };
    let bins = bins.max(1);
    let (min, max) = (min as f64, max as f64);
    // A single distinct value still gets a visible bar.
    let width = if max > min { (max - min) / bins as f64 } else { 1. };

    let mut counts = vec![0u32; bins];
    for &value in values {
        let bin = ((value as f64 - min) / width) as usize;
        counts[bin.min(bins - 1)] += 1;
    }
    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| {
            let start = min + width * i as f64;
            (start, start + width, count)
        })
        .collect()
}

/// Draws the class distribution pie and the length histograms into a PNG.
pub fn plot_dataset<P>(stats: &DatasetStats, output: P) -> Result<(), PlotError>
where
    P: AsRef<Utf8Path>,
{
    use plotters::prelude::*;

    let output = output.as_ref();
    let root = BitMapBackend::new(output, (1800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((1, 3));

    // Class distribution.
    let pie_area = panels[0].titled("Spam / Normal", ("sans-serif", 30))?;
    let (width, height) = pie_area.dim_in_pixel();
    let center = (width as i32 / 2, height as i32 / 2);
    let radius = f64::from(width.min(height)) * 0.35;
    let sizes = [stats.ham as f64, stats.spam as f64];
    let colors = [RGBColor(46, 139, 87), RGBColor(220, 20, 60)];
    let labels = [
        format!("Normal ({})", stats.ham),
        format!("Spam ({})", stats.spam),
    ];
    if stats.total() != 0 {
        let mut pie = plotters::element::Pie::new(&center, &radius, &sizes, &colors, &labels);
        pie.label_style(("sans-serif", 20).into_font().color(&BLACK));
        pie.percentages(("sans-serif", 18).into_font().color(&WHITE));
        pie_area.draw(&pie)?;
    }

    draw_histogram(
        &panels[1],
        "Message length (characters)",
        &histogram(&stats.lengths, LENGTH_BINS),
        RGBColor(70, 130, 180),
    )?;
    draw_histogram(
        &panels[2],
        "Words per message",
        &histogram(&stats.word_counts, WORD_COUNT_BINS),
        RGBColor(255, 140, 0),
    )?;

    root.present()?;
    tracing::debug!(%output, "Dataset plot saved");
    Ok(())
}

fn draw_histogram(
    area: &plotters::drawing::DrawingArea<
        plotters::prelude::BitMapBackend<'_>,
        plotters::coord::Shift,
    >,
    caption: &str,
    bins: &[(f64, f64, u32)],
    color: plotters::style::RGBColor,
) -> Result<(), PlotError> {
    use plotters::prelude::*;

    let (Some(x_range), Some(max_count)) = (
        padded_range(bins.iter().flat_map(|(start, end, _)| [*start, *end])),
        bins.iter().map(|(_, _, count)| *count).max(),
    ) else {
        return Ok(());
    };

    let mut chart = ChartBuilder::on(area)
        .x_label_area_size(35)
        .y_label_area_size(50)
        .margin(10)
        .caption(caption, ("sans-serif", 30).into_font())
        .build_cartesian_2d(x_range, 0u32..max_count + max_count / 10 + 1)?;
    chart
        .configure_mesh()
        .disable_x_mesh()
        .y_desc("Messages")
        .draw()?;
    chart.draw_series(bins.iter().map(|&(start, end, count)| {
        Rectangle::new([(start, 0), (end, count)], color.filled())
    }))?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bins_cover_every_value() {
        let values = [1, 2, 2, 3, 10];
        let bins = histogram(&values, 3);
        assert_eq!(bins.len(), 3);
        assert_eq!(bins.iter().map(|(_, _, count)| count).sum::<u32>(), 5);
        assert_eq!(bins[0].2, 4);
        assert_eq!(bins[2].2, 1);
        assert_eq!(bins[0].0, 1.);
        assert_eq!(bins[2].1, 10.);
    }

    #[test]
    fn degenerate_input() {
        assert!(histogram(&[], 10).is_empty());
        let bins = histogram(&[7, 7, 7], 5);
        assert_eq!(bins[0].2, 3);
    }

    #[test]
    fn writes_png() {
        let stats = DatasetStats {
            spam: 2,
            ham: 3,
            lengths: vec![10, 20, 35, 160, 42],
            word_counts: vec![2, 4, 6, 25, 8],
        };
        let dir = tempfile::tempdir().unwrap();
        let path = camino::Utf8PathBuf::from_path_buf(dir.path().join("dataset.png")).unwrap();
        if let Err(error) = plot_dataset(&stats, &path) {
            // Text rendering needs a font backend which might be disabled.
            eprintln!("Plotting failed: {error}");
            return;
        }
        assert!(path.exists());
    }
}
