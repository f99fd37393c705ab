/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

pub mod iperf;
pub mod netperf;

use crate::{
    config::Timing,
    provision::{ClientEnv, ClientNetwork},
};
use anyhow::Context;
use async_trait::async_trait;
use colored::Colorize;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UdpQuality {
    pub jitter_ms: f64,
    pub lost_percent: f64,
}

/// Counts of measurement samples dropped from the battery, by failure kind.
/// A dropped sample never contributes to any aggregate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureTally {
    /// The tool could not be launched at all.
    pub spawn: u32,
    /// The tool exited with a non-zero status.
    pub exit: u32,
    /// The tool ran but its output could not be parsed.
    pub parse: u32,
}
impl FailureTally {
    pub fn total(&self) -> u32 {
        self.spawn + self.exit + self.parse
    }

    fn note(&mut self, failure: &ProbeFailure) {
        match failure {
            ProbeFailure::Spawn(_) => self.spawn += 1,
            ProbeFailure::Exit { .. } => self.exit += 1,
            ProbeFailure::Parse(_) => self.parse += 1,
        }
    }
}

/// The complete aggregate of all battery outputs for one network mode.
///
/// `udp: None` marks an unavailable UDP result; it is deliberately
/// distinguishable from a genuine zero-jitter/zero-loss measurement.
/// Likewise `cpu_avg` is `None` rather than zero when no throughput run
/// succeeded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModeResult {
    /// Per-second throughput (Gbps) for each successful repetition.
    pub throughput_runs: Vec<Vec<f64>>,
    /// Combined local+remote CPU utilization, averaged over successful runs.
    pub cpu_avg: Option<f64>,
    /// One tail-latency value (µs) per successful probe.
    pub latency_samples: Vec<f64>,
    pub udp: Option<UdpQuality>,
    #[serde(default)]
    pub dropped: FailureTally,
}

#[derive(Debug)]
pub struct ProbeOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Seam between the battery and the container runtime. The battery only
/// cares that a measurement tool ran somewhere on the mode's network and
/// produced output; tests script this boundary directly.
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run_probe(&self, argv: &[String]) -> anyhow::Result<ProbeOutput>;
}

/// Launches measurement tools through the docker CLI with typed argument
/// vectors: either an ephemeral `docker run --rm` on the mode's network, or
/// `docker exec` into the provisioned client container.
pub struct DockerProbeRunner {
    image: String,
    env: ClientEnv,
}
impl DockerProbeRunner {
    pub fn new(image: String, env: ClientEnv) -> Self {
        Self { image, env }
    }

    fn docker_args(&self, argv: &[String]) -> Vec<String> {
        let mut args: Vec<String> = match &self.env {
            ClientEnv::Run {
                network: ClientNetwork::Host,
            } => vec![
                "run".to_string(),
                "--rm".to_string(),
                "--net=host".to_string(),
                self.image.clone(),
            ],
            ClientEnv::Run {
                network: ClientNetwork::Named(network),
            } => vec![
                "run".to_string(),
                "--rm".to_string(),
                "--network".to_string(),
                network.clone(),
                self.image.clone(),
            ],
            ClientEnv::Exec { container } => vec!["exec".to_string(), container.clone()],
        };
        args.extend(argv.iter().cloned());
        args
    }
}

#[async_trait]
impl ProbeRunner for DockerProbeRunner {
    async fn run_probe(&self, argv: &[String]) -> anyhow::Result<ProbeOutput> {
        let args = self.docker_args(argv);
        let output = tokio::process::Command::new("docker")
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .context(format!("failed to launch docker {}", args.join(" ")))?;

        Ok(ProbeOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

enum ProbeFailure {
    Spawn(anyhow::Error),
    Exit { stderr: String },
    Parse(anyhow::Error),
}
impl fmt::Display for ProbeFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProbeFailure::Spawn(e) => write!(f, "tool failed to launch: {:#}", e),
            ProbeFailure::Exit { stderr } => {
                write!(f, "tool exited with an error: {}", stderr.trim())
            }
            ProbeFailure::Parse(e) => write!(f, "tool output could not be parsed: {:#}", e),
        }
    }
}

async fn probe_and_parse<T>(
    runner: &dyn ProbeRunner,
    argv: &[String],
    parse: impl Fn(&str) -> anyhow::Result<T>,
) -> Result<T, ProbeFailure> {
    let output = runner
        .run_probe(argv)
        .await
        .map_err(ProbeFailure::Spawn)?;

    if !output.success {
        return Err(ProbeFailure::Exit {
            stderr: output.stderr,
        });
    }

    parse(&output.stdout).map_err(ProbeFailure::Parse)
}

fn throughput_argv(target: &str, duration_secs: u64) -> Vec<String> {
    vec![
        "iperf3".to_string(),
        "-c".to_string(),
        target.to_string(),
        "-t".to_string(),
        duration_secs.to_string(),
        "--json".to_string(),
    ]
}

fn latency_argv(target: &str) -> Vec<String> {
    vec![
        "netperf".to_string(),
        "-H".to_string(),
        target.to_string(),
        "-t".to_string(),
        "TCP_RR".to_string(),
        "-l".to_string(),
        "1".to_string(),
        "--".to_string(),
        "-o".to_string(),
        "P99_LATENCY".to_string(),
    ]
}

fn udp_argv(target: &str, duration_secs: u64) -> Vec<String> {
    vec![
        "iperf3".to_string(),
        "-c".to_string(),
        target.to_string(),
        "-t".to_string(),
        duration_secs.to_string(),
        "-u".to_string(),
        "-b".to_string(),
        "0".to_string(),
        "--json".to_string(),
    ]
}

/// A one-second handshake probe used by the provisioner's readiness poll.
pub(crate) fn handshake_argv(target: &str) -> Vec<String> {
    throughput_argv(target, 1)
}

/// Runs the full measurement battery against one target: TCP throughput+CPU
/// across `repetitions` runs, TCP_RR tail latency across `latency_samples`
/// probes, then one unlimited-bandwidth UDP stress transfer.
///
/// Always returns a well-formed [`ModeResult`]: individual sample failures
/// are classified, logged and dropped; a failed UDP phase yields `udp: None`.
pub async fn run_battery(
    runner: &dyn ProbeRunner,
    target: &str,
    timing: &Timing,
) -> ModeResult {
    let mut dropped = FailureTally::default();

    // --- throughput + cpu phase ---
    let mut throughput_runs = Vec::new();
    let mut cpu_samples = Vec::new();
    for repetition in 1..=timing.repetitions {
        println!(
            "> {} run {}/{} ({}s)",
            "throughput".green(),
            repetition,
            timing.repetitions,
            timing.duration_secs
        );

        let argv = throughput_argv(target, timing.duration_secs);
        match probe_and_parse(runner, &argv, |out| {
            iperf::parse_throughput(out, timing.duration_secs)
        })
        .await
        {
            Ok((series, cpu)) => {
                throughput_runs.push(series);
                cpu_samples.push(cpu);
            }
            Err(failure) => {
                dropped.note(&failure);
                warn!("throughput repetition {repetition} dropped: {failure}");
            }
        }
    }
    let cpu_avg = (!cpu_samples.is_empty())
        .then(|| cpu_samples.iter().sum::<f64>() / cpu_samples.len() as f64);

    // --- latency phase ---
    println!(
        "> collecting {} {} samples",
        timing.latency_samples,
        "latency".green()
    );
    let mut latency_samples = Vec::new();
    for sample in 1..=timing.latency_samples {
        let argv = latency_argv(target);
        match probe_and_parse(runner, &argv, |out| netperf::parse_rr_latency(out)).await {
            Ok(latency) => latency_samples.push(latency),
            Err(failure) => {
                dropped.note(&failure);
                warn!("latency sample {sample} dropped: {failure}");
            }
        }
    }

    // --- udp quality phase ---
    println!("> {} stress transfer ({}s)", "udp".green(), timing.udp_duration_secs);
    let argv = udp_argv(target, timing.udp_duration_secs);
    let udp = match probe_and_parse(runner, &argv, |out| iperf::parse_udp(out)).await {
        Ok(quality) => Some(quality),
        Err(failure) => {
            dropped.note(&failure);
            warn!("udp phase unavailable: {failure}");
            None
        }
    };

    if dropped.total() > 0 {
        warn!(
            "battery dropped {} sample(s): {} launch, {} exit, {} parse",
            dropped.total(),
            dropped.spawn,
            dropped.exit,
            dropped.parse
        );
    }

    ModeResult {
        throughput_runs,
        cpu_avg,
        latency_samples,
        udp,
        dropped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::{collections::VecDeque, sync::Mutex};

    /// Replays a scripted sequence of probe outcomes in call order.
    struct StubRunner {
        script: Mutex<VecDeque<anyhow::Result<ProbeOutput>>>,
    }
    impl StubRunner {
        fn new(script: Vec<anyhow::Result<ProbeOutput>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
            }
        }
    }

    #[async_trait]
    impl ProbeRunner for StubRunner {
        async fn run_probe(&self, _argv: &[String]) -> anyhow::Result<ProbeOutput> {
            self.script
                .lock()
                .expect("script mutex poisoned")
                .pop_front()
                .expect("battery ran more probes than the test scripted")
        }
    }

    fn ok(stdout: &str) -> anyhow::Result<ProbeOutput> {
        Ok(ProbeOutput {
            success: true,
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    fn nonzero_exit(stderr: &str) -> anyhow::Result<ProbeOutput> {
        Ok(ProbeOutput {
            success: false,
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    fn tcp_json(gbps: f64, seconds: usize, cpu_each: f64) -> String {
        let intervals = (0..seconds)
            .map(|_| format!(r#"{{"sum": {{"bits_per_second": {}}}}}"#, gbps * 1e9))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            r#"{{"intervals": [{intervals}], "end": {{"cpu_utilization_percent": {{"host_total": {cpu_each}, "remote_total": {cpu_each}}}}}}}"#
        )
    }

    const UDP_JSON: &str =
        r#"{"end": {"sum": {"jitter_ms": 0.05, "lost_percent": 2.5}}}"#;

    fn short_timing() -> Timing {
        Timing {
            duration_secs: 3,
            repetitions: 3,
            latency_samples: 2,
            udp_duration_secs: 1,
            ..Timing::default()
        }
    }

    #[tokio::test]
    async fn sample_set_length_equals_successful_repetitions() {
        let runner = StubRunner::new(vec![
            ok(&tcp_json(9.5, 3, 10.0)),
            Err(anyhow!("docker: daemon unreachable")),
            ok(&tcp_json(9.3, 3, 12.0)),
            ok("banner\n180\n"),
            ok("banner\n190\n"),
            ok(UDP_JSON),
        ]);

        let result = run_battery(&runner, "10.0.0.2", &short_timing()).await;

        assert_eq!(result.throughput_runs.len(), 2);
        assert_eq!(result.dropped.spawn, 1);
        assert_eq!(result.latency_samples, vec![180.0, 190.0]);
        assert_eq!(
            result.udp,
            Some(UdpQuality {
                jitter_ms: 0.05,
                lost_percent: 2.5
            })
        );
    }

    #[tokio::test]
    async fn cpu_average_is_absent_when_every_run_fails() {
        let runner = StubRunner::new(vec![
            nonzero_exit("unable to connect to server"),
            nonzero_exit("unable to connect to server"),
            nonzero_exit("unable to connect to server"),
            ok("banner\n150\n"),
            ok("banner\n160\n"),
            ok(UDP_JSON),
        ]);

        let result = run_battery(&runner, "10.0.0.2", &short_timing()).await;

        assert!(result.throughput_runs.is_empty());
        assert_eq!(result.cpu_avg, None);
        assert_eq!(result.dropped.exit, 3);
    }

    #[tokio::test]
    async fn unparseable_latency_samples_are_dropped_not_zeroed() {
        let runner = StubRunner::new(vec![
            ok(&tcp_json(1.0, 3, 5.0)),
            ok(&tcp_json(1.0, 3, 5.0)),
            ok(&tcp_json(1.0, 3, 5.0)),
            ok("banner\n175\n"),
            ok("establish control: connection refused"),
            ok(UDP_JSON),
        ]);

        let result = run_battery(&runner, "10.0.0.2", &short_timing()).await;

        assert_eq!(result.latency_samples, vec![175.0]);
        assert_eq!(result.dropped.parse, 1);
    }

    #[tokio::test]
    async fn failed_udp_phase_is_marked_unavailable() {
        let runner = StubRunner::new(vec![
            ok(&tcp_json(1.0, 3, 5.0)),
            ok(&tcp_json(1.0, 3, 5.0)),
            ok(&tcp_json(1.0, 3, 5.0)),
            ok("banner\n175\n"),
            ok("banner\n185\n"),
            nonzero_exit("unable to connect to server"),
        ]);

        let result = run_battery(&runner, "10.0.0.2", &short_timing()).await;

        // distinguishable from a genuine (0, 0) measurement
        assert_eq!(result.udp, None);
        assert_eq!(result.dropped.exit, 1);
    }

    #[tokio::test]
    async fn cpu_average_combines_local_and_remote_sides() {
        let runner = StubRunner::new(vec![
            ok(&tcp_json(9.0, 3, 10.0)),
            ok(&tcp_json(9.0, 3, 20.0)),
            ok(&tcp_json(9.0, 3, 30.0)),
            ok("banner\n100\n"),
            ok("banner\n100\n"),
            ok(UDP_JSON),
        ]);

        let result = run_battery(&runner, "10.0.0.2", &short_timing()).await;

        // each report contributes host_total + remote_total
        assert_eq!(result.cpu_avg, Some(40.0));
    }

    #[test]
    fn ephemeral_runner_builds_docker_run_args() {
        let runner = DockerProbeRunner::new(
            "netbench/tools".to_string(),
            ClientEnv::Run {
                network: ClientNetwork::Named("netbench-bridge".to_string()),
            },
        );
        let args = runner.docker_args(&throughput_argv("172.18.0.2", 30));
        assert_eq!(
            args,
            vec![
                "run",
                "--rm",
                "--network",
                "netbench-bridge",
                "netbench/tools",
                "iperf3",
                "-c",
                "172.18.0.2",
                "-t",
                "30",
                "--json"
            ]
        );
    }

    #[test]
    fn exec_runner_builds_docker_exec_args() {
        let runner = DockerProbeRunner::new(
            "netbench/tools".to_string(),
            ClientEnv::Exec {
                container: "netbench-client".to_string(),
            },
        );
        let args = runner.docker_args(&latency_argv("192.168.100.200"));
        assert_eq!(args[..2], ["exec", "netbench-client"]);
        assert_eq!(args[2], "netperf");
    }
}
