use crate::{aggregate, config::Config, store::ComparisonStore};
use anyhow::{anyhow, Context};
use charming::{
    component::{Axis, Grid, Legend, Title},
    element::{AxisType, ItemStyle, LineStyle, Tooltip},
    series::{Bar, Boxplot, Line},
    theme::Theme,
    Chart, HtmlRenderer,
};
use std::path::Path;
use tracing::info;

// Palette keyed by mode name, matching across all four charts.
const MODE_COLORS: &[(&str, &str)] = &[
    ("host", "#1f77b4"),
    ("bridge", "#ff7f0e"),
    ("overlay", "#2ca02c"),
    ("macvlan", "#d62728"),
];
const FALLBACK_COLOR: &str = "#7f7f7f";

const THROUGHPUT_COLOR: &str = "#1f77b4";
const CPU_COLOR: &str = "#d62728";
const JITTER_COLOR: &str = "#9467bd";
const LOSS_COLOR: &str = "#d62728";

fn mode_color(mode: &str) -> &'static str {
    MODE_COLORS
        .iter()
        .find(|(name, _)| *name == mode)
        .map(|(_, color)| *color)
        .unwrap_or(FALLBACK_COLOR)
}

/// Renders the four comparison artifacts into the results directory. The
/// caller has already checked that every expected mode is present; within
/// each chart, modes with no usable data are skipped rather than drawn as
/// zero.
pub fn render_all(store: &ComparisonStore, cfg: &Config) -> anyhow::Result<()> {
    let dir = &cfg.experiment.results_dir;
    std::fs::create_dir_all(dir)
        .context(format!("unable to create results dir {}", dir.display()))?;
    let order = &cfg.experiment.modes;

    save_chart(throughput_stability_chart(store, order), "throughput_stability", dir)?;
    save_chart(efficiency_chart(store, order), "efficiency", dir)?;
    save_chart(latency_distribution_chart(store, order), "latency_distribution", dir)?;
    save_chart(udp_quality_chart(store, order), "udp_quality", dir)?;
    Ok(())
}

fn save_chart(chart: Chart, name: &str, dir: &Path) -> anyhow::Result<()> {
    let path = dir.join(format!("{name}.html"));
    let mut renderer = HtmlRenderer::new(name, 1280, 720).theme(Theme::Default);
    renderer
        .save(&chart, &path)
        .map_err(|e| anyhow!("failed to render {} chart: {}", name, e))?;
    info!("wrote {}", path.display());
    Ok(())
}

/// Per-mode mean throughput over time with ±1σ band boundaries, over the
/// common run length.
pub fn throughput_stability_chart(store: &ComparisonStore, order: &[String]) -> Chart {
    let mut chart = Chart::new()
        .title(
            Title::new()
                .text("Throughput stability (mean ± std)")
                .left("center"),
        )
        .tooltip(Tooltip::new())
        .legend(Legend::new().top("bottom"))
        .x_axis(Axis::new().type_(AxisType::Value).name("Time [s]"))
        .y_axis(Axis::new().type_(AxisType::Value).name("Throughput [Gbps]"));

    for mode in order {
        let Some(entry) = store.get(mode) else { continue };
        let Some(series) = aggregate::stability(&entry.result.throughput_runs) else {
            continue;
        };

        let color = mode_color(mode);
        let label = mode.to_uppercase();
        let points = |values: Vec<f64>| -> Vec<Vec<f64>> {
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| vec![(i + 1) as f64, v])
                .collect()
        };

        let upper: Vec<f64> = series
            .mean
            .iter()
            .zip(&series.std)
            .map(|(m, s)| m + s)
            .collect();
        let lower: Vec<f64> = series
            .mean
            .iter()
            .zip(&series.std)
            .map(|(m, s)| m - s)
            .collect();

        chart = chart.series(
            Line::new()
                .name(&label)
                .data(points(series.mean))
                .show_symbol(false)
                .line_style(LineStyle::new().width(2.5))
                .item_style(ItemStyle::new().color(color)),
        );
        // band boundaries share one legend entry so they toggle together
        let band_label = format!("{label} ±σ");
        for bound in [upper, lower] {
            chart = chart.series(
                Line::new()
                    .name(&band_label)
                    .data(points(bound))
                    .show_symbol(false)
                    .line_style(LineStyle::new().width(1.0).opacity(0.3))
                    .item_style(ItemStyle::new().color(color)),
            );
        }
    }

    chart
}

/// Average throughput vs total CPU cost per mode, on dual Y axes.
pub fn efficiency_chart(store: &ComparisonStore, order: &[String]) -> Chart {
    let mut labels = Vec::new();
    let mut throughput = Vec::new();
    let mut cpu = Vec::new();
    for mode in order {
        let Some(entry) = store.get(mode) else { continue };
        let Some(point) = aggregate::efficiency(&entry.result) else {
            continue;
        };
        labels.push(mode.to_uppercase());
        throughput.push(point.throughput_gbps);
        cpu.push(point.cpu_percent);
    }

    Chart::new()
        .title(
            Title::new()
                .text("Efficiency: throughput vs CPU cost")
                .left("center"),
        )
        .tooltip(Tooltip::new())
        .legend(Legend::new().top("bottom"))
        .x_axis(Axis::new().type_(AxisType::Category).data(labels))
        .y_axis(
            Axis::new()
                .type_(AxisType::Value)
                .name("Throughput [Gbps]")
                .position("left"),
        )
        .y_axis(
            Axis::new()
                .type_(AxisType::Value)
                .name("CPU total [%]")
                .position("right"),
        )
        .series(
            Bar::new()
                .name("Throughput [Gbps]")
                .data(throughput)
                .y_axis_index(0.0)
                .item_style(ItemStyle::new().color(THROUGHPUT_COLOR).opacity(0.8)),
        )
        .series(
            Bar::new()
                .name("CPU total [%]")
                .data(cpu)
                .y_axis_index(1.0)
                .item_style(ItemStyle::new().color(CPU_COLOR).opacity(0.8)),
        )
}

/// Boxplot of the raw tail-latency samples per mode.
pub fn latency_distribution_chart(store: &ComparisonStore, order: &[String]) -> Chart {
    let mut labels = Vec::new();
    let mut boxes = Vec::new();
    for mode in order {
        let Some(entry) = store.get(mode) else { continue };
        let Some(stats) = aggregate::latency_box(&entry.result.latency_samples) else {
            continue;
        };
        labels.push(mode.to_uppercase());
        boxes.push(vec![stats.min, stats.q1, stats.median, stats.q3, stats.max]);
    }

    Chart::new()
        .title(
            Title::new()
                .text("Transactional latency distribution (P99 per probe)")
                .left("center"),
        )
        .tooltip(Tooltip::new())
        .x_axis(Axis::new().type_(AxisType::Category).data(labels))
        .y_axis(Axis::new().type_(AxisType::Value).name("Latency [µs]"))
        .series(Boxplot::new().name("latency").data(boxes))
}

/// Two-panel bar chart: jitter on the left grid, packet loss on the right.
/// Modes with an unavailable UDP result are skipped, never drawn as zero.
pub fn udp_quality_chart(store: &ComparisonStore, order: &[String]) -> Chart {
    let mut labels = Vec::new();
    let mut jitter = Vec::new();
    let mut loss = Vec::new();
    for mode in order {
        let Some(entry) = store.get(mode) else { continue };
        let Some(udp) = &entry.result.udp else { continue };
        labels.push(mode.to_uppercase());
        jitter.push(udp.jitter_ms);
        loss.push(udp.lost_percent);
    }

    Chart::new()
        .title(
            Title::new()
                .text("UDP quality under stress")
                .left("center"),
        )
        .tooltip(Tooltip::new())
        .grid(Grid::new().left("7%").width("38%").top("14%").bottom("12%"))
        .grid(Grid::new().right("7%").width("38%").top("14%").bottom("12%"))
        .x_axis(
            Axis::new()
                .type_(AxisType::Category)
                .data(labels.clone())
                .grid_index(0.0),
        )
        .x_axis(
            Axis::new()
                .type_(AxisType::Category)
                .data(labels)
                .grid_index(1.0),
        )
        .y_axis(
            Axis::new()
                .type_(AxisType::Value)
                .name("Jitter [ms]")
                .grid_index(0.0),
        )
        .y_axis(
            Axis::new()
                .type_(AxisType::Value)
                .name("Packet loss [%]")
                .grid_index(1.0),
        )
        .series(
            Bar::new()
                .name("Jitter [ms]")
                .data(jitter)
                .x_axis_index(0.0)
                .y_axis_index(0.0)
                .item_style(ItemStyle::new().color(JITTER_COLOR).opacity(0.7)),
        )
        .series(
            Bar::new()
                .name("Packet loss [%]")
                .data(loss)
                .x_axis_index(1.0)
                .y_axis_index(1.0)
                .item_style(ItemStyle::new().color(LOSS_COLOR).opacity(0.7)),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battery::{ModeResult, UdpQuality};
    use crate::store::ModeEntry;

    fn mode_entry(mode: &str, result: ModeResult) -> ModeEntry {
        ModeEntry {
            mode: mode.to_string(),
            run_id: "aaaaa".to_string(),
            recorded_at: 0,
            result,
        }
    }

    fn populated_store() -> ComparisonStore {
        let mut store = ComparisonStore::new();
        store.insert(mode_entry(
            "host",
            ModeResult {
                throughput_runs: vec![vec![9.0, 9.1], vec![9.2, 9.3]],
                cpu_avg: Some(40.0),
                latency_samples: vec![100.0, 110.0, 120.0],
                udp: Some(UdpQuality {
                    jitter_ms: 0.02,
                    lost_percent: 0.5,
                }),
                ..ModeResult::default()
            },
        ));
        // a mode that failed everything still renders (it is skipped per chart)
        store.insert(mode_entry("bridge", ModeResult::default()));
        store
    }

    #[test]
    fn charts_build_from_partial_data_without_panicking() {
        let store = populated_store();
        let order = vec!["host".to_string(), "bridge".to_string()];

        throughput_stability_chart(&store, &order);
        efficiency_chart(&store, &order);
        latency_distribution_chart(&store, &order);
        udp_quality_chart(&store, &order);
    }

    #[test]
    fn charts_build_from_an_empty_store() {
        let store = ComparisonStore::new();
        let order = vec!["host".to_string()];

        throughput_stability_chart(&store, &order);
        efficiency_chart(&store, &order);
        latency_distribution_chart(&store, &order);
        udp_quality_chart(&store, &order);
    }

    #[test]
    fn every_mode_has_a_stable_color() {
        assert_eq!(mode_color("host"), "#1f77b4");
        assert_eq!(mode_color("macvlan"), "#d62728");
        assert_eq!(mode_color("something-new"), FALLBACK_COLOR);
    }
}
