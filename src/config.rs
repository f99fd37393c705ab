use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

static EXAMPLE_CONFIG: &str = include_str!("templates/netbench.toml");

// ******** ******** ********
// **    CONFIGURATION     **
// ******** ******** ********
#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    pub experiment: Experiment,
    #[serde(default)]
    pub timing: Timing,
    #[serde(rename(serialize = "mode", deserialize = "mode"))]
    pub modes: Vec<ModeSpec>,
}
impl Config {
    pub fn write_example_to_file(path: &Path) -> anyhow::Result<()> {
        let mut file = File::create_new(path)
            .context(format!("{} already exists", path.display()))?;
        file.write_all(EXAMPLE_CONFIG.as_bytes())?;
        Ok(())
    }

    pub fn try_from_path(path: &Path) -> anyhow::Result<Config> {
        let config_str = fs::read_to_string(path)
            .context(format!("unable to read config file {}", path.display()))?;
        Config::try_from_str(&config_str)
    }

    pub fn try_from_str(conf_str: &str) -> anyhow::Result<Config> {
        let config = toml::from_str::<Config>(conf_str)
            .map_err(|e| anyhow::anyhow!("TOML parsing error: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn find_mode(&self, mode_name: &str) -> anyhow::Result<&ModeSpec> {
        self.modes
            .iter()
            .find(|mode| mode.name == mode_name)
            .context(format!("unable to find mode with name {}", mode_name))
    }

    fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for mode in &self.modes {
            if !seen.insert(mode.name.as_str()) {
                bail!("mode {} is defined more than once", mode.name);
            }
        }

        if self.experiment.modes.is_empty() {
            bail!("experiment.modes must name at least one mode to compare");
        }
        for expected in &self.experiment.modes {
            self.find_mode(expected).context(format!(
                "experiment.modes lists {} but no [[mode]] block defines it",
                expected
            ))?;
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Experiment {
    pub name: String,
    /// Image containing iperf3 and netperf/netserver.
    pub image: String,
    #[serde(default = "default_server_container")]
    pub server_container: String,
    #[serde(default = "default_client_container")]
    pub client_container: String,
    /// The full comparison set, in test order. Charts render once every one
    /// of these has a saved result.
    pub modes: Vec<String>,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
}
impl Experiment {
    pub fn store_path(&self) -> PathBuf {
        self.results_dir.join("comparison.json")
    }
}

fn default_server_container() -> String {
    "netbench-server".to_string()
}

fn default_client_container() -> String {
    "netbench-client".to_string()
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct Timing {
    /// Duration of each bulk-transfer throughput run.
    pub duration_secs: u64,
    pub repetitions: u32,
    pub latency_samples: u32,
    pub udp_duration_secs: u64,
    pub readiness_timeout_secs: u64,
    pub readiness_interval_ms: u64,
}
impl Default for Timing {
    fn default() -> Self {
        Timing {
            duration_secs: 30,
            repetitions: 3,
            latency_samples: 30,
            udp_duration_secs: 10,
            readiness_timeout_secs: 60,
            readiness_interval_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize)]
pub struct ModeSpec {
    pub name: String,
    #[serde(flatten)]
    pub topology: Topology,
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Topology {
    /// Server shares the local network namespace; target is loopback.
    Host,
    /// Server on an isolated bridge network; target resolved by inspection.
    Bridge { network: String },
    /// L2 network bound to a physical interface with static addressing.
    /// Server and client run on different machines.
    Macvlan {
        network: String,
        parent: String,
        subnet: String,
        gateway: String,
        #[serde(default)]
        ip_range: Option<String>,
        server_ip: String,
        client_ip: String,
        #[serde(default)]
        driver: L2Driver,
    },
    /// Pre-existing attachable swarm network; target is the server's DNS name.
    Overlay { network: String },
}
impl Topology {
    /// Modes where the server runs on another machine and measurements are
    /// exec'd inside a long-lived local client container.
    pub fn remote_server(&self) -> bool {
        matches!(self, Topology::Macvlan { .. } | Topology::Overlay { .. })
    }
}

#[derive(Debug, Deserialize, PartialEq, Serialize, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum L2Driver {
    #[default]
    Macvlan,
    Ipvlan,
}
impl L2Driver {
    pub fn as_str(&self) -> &'static str {
        match self {
            L2Driver::Macvlan => "macvlan",
            L2Driver::Ipvlan => "ipvlan",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn can_load_config_file() -> anyhow::Result<()> {
        Config::try_from_path(Path::new("./fixtures/netbench.success.toml"))?;
        Ok(())
    }

    #[test]
    fn example_template_is_valid() -> anyhow::Result<()> {
        Config::try_from_str(EXAMPLE_CONFIG)?;
        Ok(())
    }

    #[test]
    fn can_find_mode_by_name() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/netbench.success.toml"))?;
        let mode = cfg.find_mode("bridge");
        assert!(mode.is_ok());

        let mode = cfg.find_mode("nope");
        assert!(mode.is_err());

        Ok(())
    }

    #[test]
    fn macvlan_mode_carries_static_addressing() -> anyhow::Result<()> {
        let cfg = Config::try_from_path(Path::new("./fixtures/netbench.success.toml"))?;
        match &cfg.find_mode("macvlan")?.topology {
            Topology::Macvlan {
                server_ip,
                client_ip,
                driver,
                ..
            } => {
                assert_eq!(server_ip, "192.168.100.200");
                assert_eq!(client_ip, "192.168.100.201");
                assert_eq!(driver, &L2Driver::Ipvlan);
            }
            other => panic!("expected a macvlan topology, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn rejects_duplicate_mode_names() {
        let conf_str = r#"
            [experiment]
            name = "dup"
            image = "netbench/tools"
            modes = ["host"]

            [[mode]]
            name = "host"
            kind = "host"

            [[mode]]
            name = "host"
            kind = "host"
        "#;
        assert!(Config::try_from_str(conf_str).is_err());
    }

    #[test]
    fn rejects_expected_mode_without_definition() {
        let conf_str = r#"
            [experiment]
            name = "missing"
            image = "netbench/tools"
            modes = ["host", "bridge"]

            [[mode]]
            name = "host"
            kind = "host"
        "#;
        assert!(Config::try_from_str(conf_str).is_err());
    }

    #[test]
    fn timing_defaults_apply_when_section_is_absent() -> anyhow::Result<()> {
        let conf_str = r#"
            [experiment]
            name = "defaults"
            image = "netbench/tools"
            modes = ["host"]

            [[mode]]
            name = "host"
            kind = "host"
        "#;
        let cfg = Config::try_from_str(conf_str)?;
        assert_eq!(cfg.timing.duration_secs, 30);
        assert_eq!(cfg.timing.repetitions, 3);
        assert_eq!(cfg.timing.latency_samples, 30);
        Ok(())
    }
}
