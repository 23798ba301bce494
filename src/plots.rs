//! Search progress visualization.
//!
//! Two modes:
//! - **Live terminal**: Unicode sparklines updated per generation
//! - **PNG export**: divergence trajectory chart via plotters (optional
//!   feature)

#[cfg(feature = "plotters")]
use plotters::prelude::*;

/// Live search progress display for the terminal.
/// Tracks best/mean divergence and oracle spend as generations complete.
pub struct LiveProgress {
    best_history: Vec<f64>,
    mean_history: Vec<f64>,
    call_history: Vec<usize>,
}

impl LiveProgress {
    pub fn new() -> Self {
        Self {
            best_history: Vec::new(),
            mean_history: Vec::new(),
            call_history: Vec::new(),
        }
    }

    /// Record metrics for a completed generation.
    pub fn record(&mut self, best: f64, mean: f64, oracle_calls: usize) {
        self.best_history.push(best);
        self.mean_history.push(mean);
        self.call_history.push(oracle_calls);
    }

    /// Render sparkline from values.
    fn sparkline(values: &[f64], width: usize) -> String {
        if values.is_empty() {
            return " ".repeat(width);
        }

        let chars = ['▁', '▂', '▃', '▄', '▅', '▆', '▇', '█'];
        let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let range = (max - min).max(0.001);

        let mut result = String::new();
        for i in 0..width {
            let idx = if values.len() <= width {
                if i < values.len() { Some(i) } else { None }
            } else {
                Some(i * values.len() / width)
            };

            if let Some(idx) = idx {
                let normalized = (values[idx] - min) / range;
                let char_idx = ((normalized * 7.0).round() as usize).min(7);
                result.push(chars[char_idx]);
            } else {
                result.push(' ');
            }
        }
        result
    }

    /// Print current progress to the terminal.
    pub fn display(&self, generation: usize, total: usize) {
        let width = 20;

        print!("\x1b[2K\r");
        print!("G{:2}/{} ", generation, total);

        if let Some(last_best) = self.best_history.last() {
            print!(
                "best[{}]{:.4} ",
                Self::sparkline(&self.best_history, width),
                last_best
            );
        }
        if let Some(last_mean) = self.mean_history.last() {
            print!(
                "mean[{}]{:.4} ",
                Self::sparkline(&self.mean_history, width),
                last_mean
            );
        }
        if let Some(calls) = self.call_history.last() {
            print!("calls:{} ", calls);
        }

        use std::io::Write;
        std::io::stdout().flush().ok();
    }

    /// Print final summary with full sparklines.
    pub fn final_summary(&self) {
        use owo_colors::OwoColorize;

        println!("\n");
        if let (Some(first), Some(last)) = (self.best_history.first(), self.best_history.last()) {
            let delta = last - first;
            let (arrow, delta_str) = if delta < 0.0 {
                ("↓", format!("{:+.4}", delta).green().to_string())
            } else if delta > 0.0 {
                ("↑", format!("{:+.4}", delta).red().to_string())
            } else {
                ("→", format!("{:+.4}", delta).dimmed().to_string())
            };
            println!(
                "  {}: {:.4} {} {:.4}  ({})",
                "Divergence".bold(),
                first,
                arrow,
                last,
                delta_str
            );
            println!("          [{}]", Self::sparkline(&self.best_history, 40).cyan());
        }
        if let Some(total) = self.call_history.last() {
            println!("  {}: {}", "Oracle calls".bold(), total);
        }
    }

    /// Export the divergence trajectory as a PNG chart.
    #[cfg(feature = "plotters")]
    pub fn export_png(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let chart_err = |e: &dyn std::fmt::Display| anyhow::anyhow!("chart export: {}", e);

        let root = BitMapBackend::new(path, (800, 500)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| chart_err(&e))?;

        let max_y = self
            .mean_history
            .iter()
            .chain(self.best_history.iter())
            .cloned()
            .fold(0.0f64, f64::max)
            .max(0.01);
        let n = self.best_history.len().max(2);

        let mut chart = ChartBuilder::on(&root)
            .caption("Divergence trajectory", ("sans-serif", 24))
            .margin(10)
            .x_label_area_size(30)
            .y_label_area_size(50)
            .build_cartesian_2d(0..n - 1, 0.0..max_y * 1.1)
            .map_err(|e| chart_err(&e))?;

        chart
            .configure_mesh()
            .x_desc("generation")
            .y_desc("KL divergence")
            .draw()
            .map_err(|e| chart_err(&e))?;

        chart
            .draw_series(LineSeries::new(
                self.best_history.iter().enumerate().map(|(i, v)| (i, *v)),
                &BLUE,
            ))
            .map_err(|e| chart_err(&e))?
            .label("best")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], BLUE));

        chart
            .draw_series(LineSeries::new(
                self.mean_history.iter().enumerate().map(|(i, v)| (i, *v)),
                &RED,
            ))
            .map_err(|e| chart_err(&e))?
            .label("generation mean")
            .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], RED));

        chart
            .configure_series_labels()
            .border_style(BLACK)
            .draw()
            .map_err(|e| chart_err(&e))?;
        root.present().map_err(|e| chart_err(&e))?;
        Ok(())
    }
}

impl Default for LiveProgress {
    fn default() -> Self {
        Self::new()
    }
}
