/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{
    battery::{handshake_argv, ProbeRunner},
    config::{Config, L2Driver, ModeSpec, Timing, Topology},
};
use anyhow::{anyhow, bail, Context};
use bollard::{
    container::{
        Config as ContainerConfig, CreateContainerOptions, NetworkingConfig,
        RemoveContainerOptions, StartContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions},
    network::{CreateNetworkOptions, InspectNetworkOptions},
    models::{EndpointIpamConfig, EndpointSettings, HostConfig, Ipam, IpamConfig},
    Docker,
};
use colored::Colorize;
use std::collections::HashMap;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

pub const LOOPBACK_ADDR: &str = "127.0.0.1";

/// Where measurement probes are launched for a provisioned mode.
#[derive(Debug, Clone)]
pub enum ClientEnv {
    /// One ephemeral client container per probe, on the mode's network.
    Run { network: ClientNetwork },
    /// Probes exec'd inside a long-lived client container (multi-host modes).
    Exec { container: String },
}

#[derive(Debug, Clone)]
pub enum ClientNetwork {
    Host,
    Named(String),
}

/// A running measurement target: the address probes connect to, and the
/// client environment they are launched from.
#[derive(Debug)]
pub struct Endpoint {
    pub addr: String,
    pub client_env: ClientEnv,
}

pub fn connect() -> anyhow::Result<Docker> {
    Docker::connect_with_defaults().context("failed to connect to the docker daemon")
}

fn ignore_not_found<T>(
    res: Result<T, bollard::errors::Error>,
) -> Result<Option<T>, bollard::errors::Error> {
    match res {
        Ok(v) => Ok(Some(v)),
        Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404, ..
        }) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Force-removes any stale endpoint with the same logical name so a rerun
/// always starts from a clean slate.
async fn remove_stale_container(docker: &Docker, name: &str) -> anyhow::Result<()> {
    let removed = ignore_not_found(
        docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await,
    )
    .context(format!("failed to remove stale container {}", name))?;

    if removed.is_some() {
        debug!("removed stale container {name}");
    }
    Ok(())
}

async fn ensure_bridge_network(docker: &Docker, network: &str) -> anyhow::Result<()> {
    let existing = ignore_not_found(
        docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await,
    )
    .context(format!("failed to inspect network {}", network))?;

    if existing.is_none() {
        docker
            .create_network(CreateNetworkOptions {
                name: network.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .context(format!("failed to create bridge network {}", network))?;
        info!("created bridge network {network}");
    }
    Ok(())
}

/// The cluster-wide overlay network is normally created once on a swarm
/// manager; creation from a worker fails and the pre-existing network is
/// assumed.
async fn ensure_overlay_network(docker: &Docker, network: &str) -> anyhow::Result<()> {
    let existing = ignore_not_found(
        docker
            .inspect_network(network, None::<InspectNetworkOptions<String>>)
            .await,
    )
    .context(format!("failed to inspect network {}", network))?;

    if existing.is_none() {
        let res = docker
            .create_network(CreateNetworkOptions {
                name: network.to_string(),
                driver: "overlay".to_string(),
                attachable: true,
                ..Default::default()
            })
            .await;
        if let Err(e) = res {
            warn!("could not create overlay network {network} (assuming it exists cluster-wide): {e}");
        }
    }
    Ok(())
}

fn l2_network_options(driver: L2Driver, parent: &str) -> HashMap<String, String> {
    let mut options = HashMap::new();
    options.insert("parent".to_string(), parent.to_string());
    if driver == L2Driver::Ipvlan {
        options.insert("ipvlan_mode".to_string(), "l2".to_string());
    }
    options
}

/// Drops and recreates the physical-L2 network so stale subnet or parent
/// settings from a previous run never leak into this one.
async fn recreate_l2_network(
    docker: &Docker,
    network: &str,
    driver: L2Driver,
    parent: &str,
    subnet: &str,
    gateway: &str,
    ip_range: Option<&str>,
) -> anyhow::Result<()> {
    ignore_not_found(docker.remove_network(network).await)
        .context(format!("failed to remove network {}", network))?;

    let ipam = Ipam {
        config: Some(vec![IpamConfig {
            subnet: Some(subnet.to_string()),
            gateway: Some(gateway.to_string()),
            ip_range: ip_range.map(str::to_string),
            ..Default::default()
        }]),
        ..Default::default()
    };

    docker
        .create_network(CreateNetworkOptions {
            name: network.to_string(),
            driver: driver.as_str().to_string(),
            ipam,
            options: l2_network_options(driver, parent),
            ..Default::default()
        })
        .await
        .context(format!(
            "failed to create {} network {} on parent {}",
            driver.as_str(),
            network,
            parent
        ))?;
    info!("created {} network {network}", driver.as_str());
    Ok(())
}

fn idle_cmd() -> Vec<String> {
    vec!["tail".to_string(), "-f".to_string(), "/dev/null".to_string()]
}

/// Creates and starts a container, either in the host namespace or attached
/// to a named network (optionally with a static address).
async fn run_container(
    docker: &Docker,
    name: &str,
    image: &str,
    cmd: Option<Vec<String>>,
    host_network: bool,
    attach: Option<(&str, Option<&str>)>,
) -> anyhow::Result<()> {
    let host_config = HostConfig {
        network_mode: host_network.then(|| "host".to_string()),
        auto_remove: Some(true),
        ..Default::default()
    };

    let networking_config = attach.map(|(network, static_ip)| {
        let endpoint = EndpointSettings {
            ipam_config: static_ip.map(|ip| EndpointIpamConfig {
                ipv4_address: Some(ip.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        NetworkingConfig {
            endpoints_config: HashMap::from([(network.to_string(), endpoint)]),
        }
    });

    docker
        .create_container(
            Some(CreateContainerOptions {
                name: name.to_string(),
                platform: None,
            }),
            ContainerConfig {
                image: Some(image.to_string()),
                cmd,
                host_config: Some(host_config),
                networking_config,
                ..Default::default()
            },
        )
        .await
        .context(format!("failed to create container {}", name))?;

    docker
        .start_container(name, None::<StartContainerOptions<String>>)
        .await
        .context(format!("failed to start container {}", name))?;
    Ok(())
}

/// Execs `iperf3 -s` and `netserver` detached inside the server container.
async fn start_server_tools(docker: &Docker, container: &str) -> anyhow::Result<()> {
    let tools: [Vec<String>; 2] = [
        vec!["iperf3".to_string(), "-s".to_string()],
        vec!["netserver".to_string()],
    ];

    for cmd in tools {
        let tool = cmd[0].clone();
        let exec = docker
            .create_exec(
                container,
                CreateExecOptions::<String> {
                    cmd: Some(cmd),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await
            .context(format!("failed to create {} exec in {}", tool, container))?;

        docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await
            .context(format!("failed to start {} in {}", tool, container))?;
    }
    Ok(())
}

/// Resolves the address a workload was assigned on a named network by
/// inspecting its attachment.
async fn container_ip(docker: &Docker, container: &str, network: &str) -> anyhow::Result<String> {
    let details = docker
        .inspect_container(container, None)
        .await
        .context(format!("failed to inspect container {}", container))?;

    details
        .network_settings
        .and_then(|settings| settings.networks)
        .and_then(|networks| networks.get(network).cloned())
        .and_then(|endpoint| endpoint.ip_address)
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| {
            anyhow!(
                "container {} has no address on network {}",
                container,
                network
            )
        })
}

/// Brings up the endpoints the `run` command measures against and resolves
/// the target address. Single-host modes (host/bridge) start the server
/// locally; multi-host modes (macvlan/overlay) start the local client
/// container and expect the server machine to be running `serve`.
pub async fn provision(
    docker: &Docker,
    cfg: &Config,
    spec: &ModeSpec,
) -> anyhow::Result<Endpoint> {
    println!("> provisioning mode {}", spec.name.green());
    let image = &cfg.experiment.image;
    let server = &cfg.experiment.server_container;
    let client = &cfg.experiment.client_container;

    match &spec.topology {
        Topology::Host => {
            remove_stale_container(docker, server).await?;
            run_container(docker, server, image, None, true, None).await?;
            start_server_tools(docker, server).await?;
            Ok(Endpoint {
                addr: LOOPBACK_ADDR.to_string(),
                client_env: ClientEnv::Run {
                    network: ClientNetwork::Host,
                },
            })
        }

        Topology::Bridge { network } => {
            remove_stale_container(docker, server).await?;
            ensure_bridge_network(docker, network).await?;
            run_container(docker, server, image, None, false, Some((network, None))).await?;
            start_server_tools(docker, server).await?;
            let addr = container_ip(docker, server, network).await?;
            Ok(Endpoint {
                addr,
                client_env: ClientEnv::Run {
                    network: ClientNetwork::Named(network.clone()),
                },
            })
        }

        Topology::Macvlan {
            network,
            parent,
            subnet,
            gateway,
            server_ip,
            client_ip,
            driver,
            ..
        } => {
            remove_stale_container(docker, client).await?;
            recreate_l2_network(docker, network, *driver, parent, subnet, gateway, None).await?;
            run_container(
                docker,
                client,
                image,
                Some(idle_cmd()),
                false,
                Some((network, Some(client_ip))),
            )
            .await?;
            Ok(Endpoint {
                addr: server_ip.clone(),
                client_env: ClientEnv::Exec {
                    container: client.clone(),
                },
            })
        }

        Topology::Overlay { network } => {
            remove_stale_container(docker, client).await?;
            run_container(
                docker,
                client,
                image,
                Some(idle_cmd()),
                false,
                Some((network, None)),
            )
            .await?;
            // swarm DNS resolves the server container by name
            Ok(Endpoint {
                addr: server.clone(),
                client_env: ClientEnv::Exec {
                    container: client.clone(),
                },
            })
        }
    }
}

/// Server side of the two-machine modes: brings up the server endpoint for
/// `serve` and returns the address clients should target. Single-host modes
/// fall through to the regular provisioning path.
pub async fn provision_serve(
    docker: &Docker,
    cfg: &Config,
    spec: &ModeSpec,
) -> anyhow::Result<String> {
    let image = &cfg.experiment.image;
    let server = &cfg.experiment.server_container;

    match &spec.topology {
        Topology::Host | Topology::Bridge { .. } => {
            let endpoint = provision(docker, cfg, spec).await?;
            Ok(endpoint.addr)
        }

        Topology::Macvlan {
            network,
            parent,
            subnet,
            gateway,
            ip_range,
            server_ip,
            driver,
            ..
        } => {
            println!("> provisioning server for mode {}", spec.name.green());
            remove_stale_container(docker, server).await?;
            recreate_l2_network(
                docker,
                network,
                *driver,
                parent,
                subnet,
                gateway,
                ip_range.as_deref(),
            )
            .await?;
            run_container(
                docker,
                server,
                image,
                None,
                false,
                Some((network, Some(server_ip))),
            )
            .await?;
            start_server_tools(docker, server).await?;
            Ok(server_ip.clone())
        }

        Topology::Overlay { network } => {
            println!("> provisioning server for mode {}", spec.name.green());
            remove_stale_container(docker, server).await?;
            ensure_overlay_network(docker, network).await?;
            run_container(docker, server, image, None, false, Some((network, None))).await?;
            start_server_tools(docker, server).await?;
            Ok(server.clone())
        }
    }
}

/// Best-effort removal of every endpoint this process may have provisioned.
/// Also runs after an interrupt, so failures are logged rather than raised.
pub async fn teardown(docker: &Docker, cfg: &Config) {
    println!("> tearing down endpoints");
    for name in [
        &cfg.experiment.server_container,
        &cfg.experiment.client_container,
    ] {
        let res = ignore_not_found(
            docker
                .remove_container(
                    name,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await,
        );
        match res {
            Ok(Some(_)) => println!("\t{} removed {}", "✓".green(), name),
            Ok(None) => {}
            Err(e) => warn!("failed to remove container {name}: {e}"),
        }
    }
}

/// Bounded-retry readiness poll: a one-second handshake transfer launched
/// through the mode's client environment, repeated until it succeeds or the
/// deadline passes. Replaces fixed post-start sleeps; exhaustion is a
/// provisioning failure.
pub async fn await_ready(
    runner: &dyn ProbeRunner,
    target: &str,
    timing: &Timing,
) -> anyhow::Result<()> {
    println!("> waiting for {} to accept connections", target.green());
    let deadline = Instant::now() + Duration::from_secs(timing.readiness_timeout_secs);
    let interval = Duration::from_millis(timing.readiness_interval_ms);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        match runner.run_probe(&handshake_argv(target)).await {
            Ok(out) if out.success => {
                debug!("endpoint {target} ready after {attempts} probe attempt(s)");
                return Ok(());
            }
            Ok(out) => debug!(
                "readiness probe against {target} refused: {}",
                out.stderr.trim()
            ),
            Err(e) => debug!("readiness probe against {target} failed to launch: {e:#}"),
        }

        if Instant::now() + interval >= deadline {
            bail!(
                "endpoint {} did not become ready within {}s ({} probe attempts)",
                target,
                timing.readiness_timeout_secs,
                attempts
            );
        }
        sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_responses_are_ignored() {
        let missing: Result<(), _> = Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".to_string(),
        });
        assert_eq!(ignore_not_found(missing).unwrap(), None);

        let failure: Result<(), _> = Err(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "daemon on fire".to_string(),
        });
        assert!(ignore_not_found(failure).is_err());

        assert_eq!(ignore_not_found(Ok(7)).unwrap(), Some(7));
    }

    #[test]
    fn ipvlan_networks_request_l2_mode() {
        let options = l2_network_options(L2Driver::Ipvlan, "wlp0s20f3");
        assert_eq!(options.get("parent").map(String::as_str), Some("wlp0s20f3"));
        assert_eq!(options.get("ipvlan_mode").map(String::as_str), Some("l2"));

        let options = l2_network_options(L2Driver::Macvlan, "eth0");
        assert!(!options.contains_key("ipvlan_mode"));
    }
}
