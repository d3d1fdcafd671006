use crate::solver::History;
use plotters::prelude::*;
use std::path::Path;

/// 学習損失と評価メトリックの推移を log10 スケールで PNG に描きます。
pub fn plot_history(history: &History, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let log_points = |points: &[(usize, f64)]| -> Vec<(usize, f64)> {
        points
            .iter()
            .filter(|(_, v)| v.is_finite() && *v > 0.0)
            .map(|&(e, v)| (e, v.log10()))
            .collect()
    };
    let train = log_points(&history.train_loss);
    let eval = log_points(&history.eval_metric);
    if train.is_empty() && eval.is_empty() {
        return Err("no finite positive values to plot".into());
    }

    let all = train.iter().chain(eval.iter());
    let max_epoch = all.clone().map(|(e, _)| *e).max().unwrap_or(1).max(1);
    let min_log = all.clone().map(|(_, v)| *v).fold(f64::INFINITY, f64::min) - 0.5;
    let max_log = all.map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max) + 0.5;

    let root = BitMapBackend::new(path, (800, 600)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption("Loss History", ("sans-serif", 40).into_font())
        .margin(10)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..max_epoch, min_log..max_log)?;
    chart
        .configure_mesh()
        .y_desc("Loss (log10 scale)")
        .x_desc("Epoch")
        .draw()?;
    chart
        .draw_series(LineSeries::new(train, &RED))?
        .label("Train Loss")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &RED));
    chart
        .draw_series(LineSeries::new(eval, &BLUE))?
        .label("Eval Metric")
        .legend(|(x, y)| PathElement::new(vec![(x, y), (x + 20, y)], &BLUE));
    chart
        .configure_series_labels()
        .background_style(&WHITE.mix(0.8))
        .border_style(&BLACK)
        .draw()?;
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_history_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let history = History {
            train_loss: vec![(1, f64::NAN)],
            eval_metric: vec![],
        };
        assert!(plot_history(&history, &dir.path().join("loss_graph.png")).is_err());
    }
}
