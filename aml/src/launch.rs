//! Launching a process group.
//!
//! Two ways to get a set of [`Aml`] contexts:
//!
//! - [`connect`]: this process is one node of a TCP group, every process
//!   gets the same `--peers` list and its own `--rank`
//! - [`run_local_group`]: every node runs as a task of the current
//!   process, over an in-process fabric
//!
//! Both need a single-threaded runtime; [`local_runtime`] builds one.

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tokio::net::TcpListener;
use tokio::task::LocalSet;
use tracing::{debug, info};

use crate::conduit::{MemConduit, MemFabric, TcpConduit, TcpConfig};
use crate::config::AmlConfig;
use crate::error::AmlError;
use crate::transport::Aml;
use crate::NodeId;

/// Command line shared by every binary that joins a group.
///
/// # Examples
///
/// ```
/// use aml::launch::{LaunchArgs, LaunchMode};
/// use clap::Parser;
///
/// let args = LaunchArgs::try_parse_from(["aml", "--local", "4", "--max-medium", "512"])
///     .expect("valid arguments");
/// assert_eq!(args.mode().expect("mode"), LaunchMode::Local { nodes: 4 });
/// assert_eq!(args.config().expect("config").max_medium, 512);
/// ```
#[derive(Parser, Debug, Clone, Default)]
pub struct LaunchArgs {
    /// Rank of this process in the group
    #[arg(long, env = "AML_RANK")]
    pub rank: Option<u32>,

    /// Address of every node, in rank order (host:port,host:port,...)
    #[arg(long, env = "AML_PEERS", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Run this many nodes inside the current process instead
    #[arg(long)]
    pub local: Option<usize>,

    /// JSON configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override the registered segment size (bytes)
    #[arg(long)]
    pub segment_size: Option<usize>,

    /// Override the inline tier ceiling (bytes)
    #[arg(long)]
    pub max_medium: Option<usize>,

    /// Override the one-shot delivery capacity (bytes)
    #[arg(long)]
    pub max_long_request: Option<usize>,
}

/// How the group is formed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchMode {
    /// All nodes in this process.
    Local {
        /// Group size.
        nodes: usize,
    },
    /// One node per process, connected over TCP.
    Tcp {
        /// This process's rank.
        rank: NodeId,
        /// Every node's address, by rank.
        peers: Vec<SocketAddr>,
    },
}

impl LaunchArgs {
    /// Group formation requested by the arguments. `--local` wins over
    /// `--rank` / `--peers`.
    ///
    /// # Errors
    ///
    /// [`AmlError::Bootstrap`] when neither mode is fully specified.
    pub fn mode(&self) -> Result<LaunchMode, AmlError> {
        if let Some(nodes) = self.local {
            if nodes == 0 {
                return Err(AmlError::Bootstrap {
                    message: "--local needs at least one node".to_string(),
                });
            }
            return Ok(LaunchMode::Local { nodes });
        }

        let rank = self.rank.ok_or_else(|| AmlError::Bootstrap {
            message: "missing --rank (or AML_RANK), or use --local".to_string(),
        })?;
        if self.peers.is_empty() {
            return Err(AmlError::Bootstrap {
                message: "missing --peers (or AML_PEERS)".to_string(),
            });
        }
        if rank as usize >= self.peers.len() {
            return Err(AmlError::Bootstrap {
                message: format!("rank {rank} outside of {} peers", self.peers.len()),
            });
        }
        Ok(LaunchMode::Tcp {
            rank: NodeId::new(rank),
            peers: self.peers.clone(),
        })
    }

    /// Configuration: the file if given (else the preset for the mode),
    /// then the command line overrides.
    ///
    /// # Errors
    ///
    /// [`AmlError::InvalidConfig`] when the file cannot be loaded or the
    /// result does not validate.
    pub fn config(&self) -> Result<AmlConfig, AmlError> {
        let mut config = match &self.config {
            Some(path) => AmlConfig::from_json_file(path)?,
            None if self.local.is_some() => AmlConfig::local(),
            None => AmlConfig::default(),
        };
        if let Some(segment_size) = self.segment_size {
            config.segment_size = segment_size;
        }
        if let Some(max_medium) = self.max_medium {
            config.max_medium = max_medium;
        }
        if let Some(max_long_request) = self.max_long_request {
            config.max_long_request = max_long_request;
        }
        config.validate()?;
        Ok(config)
    }
}

/// Single-threaded runtime suitable for driving a group.
///
/// Run the group inside a [`LocalSet`] on it.
pub fn local_runtime() -> Result<tokio::runtime::Runtime, AmlError> {
    tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .map_err(|err| AmlError::Bootstrap {
            message: format!("failed to build runtime: {err}"),
        })
}

/// Join a TCP group as described by `args`.
///
/// Binds this rank's address, connects the mesh and bootstraps. Must run
/// inside a [`LocalSet`].
///
/// # Errors
///
/// [`AmlError::Bootstrap`] when the arguments do not describe a TCP group
/// or the address cannot be bound, [`AmlError::Conduit`] when the mesh
/// cannot be formed.
pub async fn connect(args: &LaunchArgs) -> Result<Aml<TcpConduit>, AmlError> {
    let (rank, peers) = match args.mode()? {
        LaunchMode::Tcp { rank, peers } => (rank, peers),
        LaunchMode::Local { .. } => {
            return Err(AmlError::Bootstrap {
                message: "connect needs --rank and --peers, not --local".to_string(),
            })
        }
    };
    let config = args.config()?;

    let addr = peers[rank.index()];
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|err| AmlError::Bootstrap {
            message: format!("failed to bind {addr}: {err}"),
        })?;
    debug!(%rank, %addr, "listening");

    let conduit = TcpConduit::establish(
        listener,
        rank,
        peers,
        config.segment_size,
        TcpConfig::default(),
    )
    .await?;
    Aml::init(conduit, config).await
}

/// Run `body` on every node of an in-process group of `nodes` nodes.
///
/// Each node bootstraps, then `body` receives its context and is
/// responsible for finalizing it. Results come back in rank order. A panic
/// on any node is resumed on the caller once that node is awaited; the
/// panicking node's context aborts the group, so its peers return
/// [`AmlError::GroupAborted`] instead of blocking.
///
/// # Examples
///
/// ```
/// use aml::launch::{local_runtime, run_local_group};
/// use aml::AmlConfig;
///
/// let runtime = local_runtime().expect("runtime");
/// let results = runtime.block_on(run_local_group(3, AmlConfig::local(), |mut aml| async move {
///     let total = aml.all_sum(aml.self_id().get() as i64).await?;
///     aml.finalize().await?;
///     Ok::<_, aml::AmlError>(total)
/// }));
/// for result in results {
///     assert_eq!(result.expect("node succeeded"), 3);
/// }
/// ```
pub async fn run_local_group<F, Fut, T>(
    nodes: usize,
    config: AmlConfig,
    body: F,
) -> Vec<Result<T, AmlError>>
where
    F: Fn(Aml<MemConduit>) -> Fut + Clone + 'static,
    Fut: Future<Output = Result<T, AmlError>> + 'static,
    T: 'static,
{
    let fabric = MemFabric::uniform(nodes, config.segment_size);
    let local = LocalSet::new();
    let handles: Vec<_> = fabric
        .conduits()
        .into_iter()
        .map(|conduit| {
            let body = body.clone();
            let config = config.clone();
            local.spawn_local(async move {
                let aml = Aml::init(conduit, config).await?;
                body(aml).await
            })
        })
        .collect();
    info!(nodes, "in-process group started");

    local
        .run_until(async move {
            let mut results = Vec::with_capacity(handles.len());
            for handle in handles {
                match handle.await {
                    Ok(result) => results.push(result),
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(err) => results.push(Err(AmlError::Bootstrap {
                        message: format!("node task cancelled: {err}"),
                    })),
                }
            }
            results
        })
        .await
}
