use anyhow::Context;

/// Extracts the latency scalar from a `netperf ... -- -o P99_LATENCY` run.
/// Netperf prints banner lines before the selected output; the value is the
/// last non-empty line.
pub fn parse_rr_latency(stdout: &str) -> anyhow::Result<f64> {
    let last_line = stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .context("netperf produced no output")?;

    last_line
        .parse::<f64>()
        .context(format!("netperf output ended in {:?}, not a latency value", last_line))
}
