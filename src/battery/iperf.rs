use super::UdpQuality;
use anyhow::Context;
use serde::Deserialize;

/// Subset of iperf3's `--json` report for a TCP bulk transfer. Only the
/// fields the battery extracts are modelled; everything else is ignored.
#[derive(Debug, Deserialize)]
struct TcpReport {
    intervals: Vec<Interval>,
    end: TcpEnd,
}

#[derive(Debug, Deserialize)]
struct Interval {
    sum: IntervalSum,
}

#[derive(Debug, Deserialize)]
struct IntervalSum {
    bits_per_second: f64,
}

#[derive(Debug, Deserialize)]
struct TcpEnd {
    cpu_utilization_percent: CpuUtilization,
}

#[derive(Debug, Deserialize)]
struct CpuUtilization {
    host_total: f64,
    remote_total: f64,
}

/// Extracts the per-second throughput series (Gbps, truncated to the
/// configured duration) and the combined local+remote CPU utilization
/// percentage from an iperf3 TCP report.
pub fn parse_throughput(json: &str, duration_secs: u64) -> anyhow::Result<(Vec<f64>, f64)> {
    let report: TcpReport =
        serde_json::from_str(json).context("iperf3 TCP report is not valid JSON")?;

    let series = report
        .intervals
        .iter()
        .map(|interval| interval.sum.bits_per_second / 1e9)
        .take(duration_secs as usize)
        .collect();

    let cpu = report.end.cpu_utilization_percent.host_total
        + report.end.cpu_utilization_percent.remote_total;

    Ok((series, cpu))
}

#[derive(Debug, Deserialize)]
struct UdpReport {
    end: UdpEnd,
}

#[derive(Debug, Deserialize)]
struct UdpEnd {
    sum: UdpSum,
}

#[derive(Debug, Deserialize)]
struct UdpSum {
    jitter_ms: f64,
    lost_percent: f64,
}

pub fn parse_udp(json: &str) -> anyhow::Result<UdpQuality> {
    let report: UdpReport =
        serde_json::from_str(json).context("iperf3 UDP report is not valid JSON")?;

    Ok(UdpQuality {
        jitter_ms: report.end.sum.jitter_ms,
        lost_percent: report.end.sum.lost_percent,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tcp_report(interval_bps: &[f64], host_cpu: f64, remote_cpu: f64) -> String {
        let intervals = interval_bps
            .iter()
            .map(|bps| format!(r#"{{"sum": {{"bits_per_second": {bps}}}}}"#))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{
                "intervals": [{intervals}],
                "end": {{
                    "cpu_utilization_percent": {{
                        "host_total": {host_cpu},
                        "remote_total": {remote_cpu}
                    }}
                }}
            }}"#
        )
    }

    #[test]
    fn extracts_gbps_series_and_combined_cpu() -> anyhow::Result<()> {
        let json = tcp_report(&[1.0e9, 2.0e9, 3.0e9], 12.5, 7.5);
        let (series, cpu) = parse_throughput(&json, 30)?;

        assert_eq!(series, vec![1.0, 2.0, 3.0]);
        assert_eq!(cpu, 20.0);
        Ok(())
    }

    #[test]
    fn truncates_series_to_configured_duration() -> anyhow::Result<()> {
        let json = tcp_report(&[1.0e9, 1.0e9, 1.0e9, 1.0e9], 1.0, 1.0);
        let (series, _) = parse_throughput(&json, 2)?;

        assert_eq!(series.len(), 2);
        Ok(())
    }

    #[test]
    fn rejects_malformed_tcp_report() {
        assert!(parse_throughput("error: unable to connect", 30).is_err());
        assert!(parse_throughput(r#"{"intervals": []}"#, 30).is_err());
    }

    #[test]
    fn extracts_udp_quality() -> anyhow::Result<()> {
        let json = r#"{
            "end": {
                "sum": {"jitter_ms": 0.042, "lost_percent": 1.75}
            }
        }"#;
        let udp = parse_udp(json)?;

        assert_eq!(udp.jitter_ms, 0.042);
        assert_eq!(udp.lost_percent, 1.75);
        Ok(())
    }

    #[test]
    fn rejects_malformed_udp_report() {
        assert!(parse_udp("").is_err());
        assert!(parse_udp(r#"{"end": {}}"#).is_err());
    }
}
