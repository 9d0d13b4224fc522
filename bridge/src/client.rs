//! The client facade: the public object host code talks to.

use crate::launcher::{self, WorkerProcess};
use crate::mock;
use crate::transport::HttpTransport;
use commons::codec::{self, DEFAULT_PROTOCOL};
use commons::dispatch::{dispatch, MOCK_HOST};
use commons::port;
use commons::registry::ExtensionRegistry;
use commons::rpc::{Request, Response};
use commons::{BridgeError, Value, ValueMap};
use log::{debug, info, warn};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;

/// Identifies one worker instance.
///
/// Created by the builder; the port is assigned at launch; immutable
/// once the worker is ready.
#[derive(Clone, Debug)]
pub struct WorkerDescriptor {
    /// Extension the worker loads: a registry name or a cdylib path.
    pub module: String,
    /// Loopback literal the worker binds, or `none` for mock mode.
    pub host: String,
    /// Port chosen at launch; 0 until then, and always 0 in mock mode.
    pub port: u16,
    /// Directory holding the worker executable, when not on PATH.
    pub worker_dir: Option<PathBuf>,
    /// Exact worker executable, overriding any lookup.
    pub worker_exe: Option<PathBuf>,
    /// Entries prepended to the worker's module search path.
    pub sys_path: Vec<PathBuf>,
    /// Entries prepended to the worker's OS library search path.
    pub env_path: Vec<PathBuf>,
    /// User options handed to the extension constructor. String-valued:
    /// they travel through argv and lose type fidelity.
    pub options: BTreeMap<String, String>,
    /// Object-codec protocol version advertised to the worker.
    pub protocol: u16,
    /// How long to wait for the worker to accept connections.
    pub readiness_deadline: Duration,
    /// Per-call deadline; `None` means unbounded.
    pub call_timeout: Option<Duration>,
    /// How long shutdown waits for a voluntary exit.
    pub grace: Duration,
    /// How long shutdown waits after the termination signal.
    pub kill: Duration,
}

/// Configures and starts a [`Client`].
pub struct ClientBuilder {
    descriptor: WorkerDescriptor,
    registry: ExtensionRegistry,
}

impl ClientBuilder {
    /// Start configuring a client for the given extension module.
    pub fn new<S: Into<String>>(module: S) -> Self {
        ClientBuilder {
            descriptor: WorkerDescriptor {
                module: module.into(),
                host: "127.0.0.1".to_string(),
                port: 0,
                worker_dir: None,
                worker_exe: None,
                sys_path: Vec::new(),
                env_path: Vec::new(),
                options: BTreeMap::new(),
                protocol: DEFAULT_PROTOCOL,
                readiness_deadline: Duration::from_secs(10),
                call_timeout: None,
                grace: Duration::from_secs(5),
                kill: Duration::from_secs(5),
            },
            registry: ExtensionRegistry::new(),
        }
    }

    /// Set the host address; the literal `none` selects mock mode.
    pub fn host<S: Into<String>>(mut self, host: S) -> Self {
        self.descriptor.host = host.into();
        self
    }

    /// Run the extension in-process instead of spawning a worker.
    pub fn mock(self) -> Self {
        self.host(MOCK_HOST)
    }

    /// Directory holding the worker executable.
    pub fn worker_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.descriptor.worker_dir = Some(dir.into());
        self
    }

    /// Exact worker executable to spawn.
    pub fn worker_exe<P: Into<PathBuf>>(mut self, exe: P) -> Self {
        self.descriptor.worker_exe = Some(exe.into());
        self
    }

    /// Append an entry to the worker's module search path.
    pub fn sys_path<P: Into<PathBuf>>(mut self, entry: P) -> Self {
        self.descriptor.sys_path.push(entry.into());
        self
    }

    /// Append an entry to the worker's OS library search path.
    pub fn env_path<P: Into<PathBuf>>(mut self, entry: P) -> Self {
        self.descriptor.env_path.push(entry.into());
        self
    }

    /// Pass one user option to the extension constructor.
    pub fn option<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.descriptor.options.insert(key.into(), value.into());
        self
    }

    /// Advertise a specific object-codec protocol version.
    pub fn protocol(mut self, protocol: u16) -> Self {
        self.descriptor.protocol = protocol;
        self
    }

    /// Deadline for the worker to become ready.
    pub fn readiness_deadline(mut self, deadline: Duration) -> Self {
        self.descriptor.readiness_deadline = deadline;
        self
    }

    /// Per-call deadline; unset means unbounded.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.call_timeout = Some(timeout);
        self
    }

    /// How long shutdown waits for a voluntary exit.
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.descriptor.grace = grace;
        self
    }

    /// How long shutdown waits after the termination signal before the
    /// hard kill.
    pub fn kill_deadline(mut self, kill: Duration) -> Self {
        self.descriptor.kill = kill;
        self
    }

    /// Extension catalog used to build the extension in mock mode.
    pub fn registry(mut self, registry: ExtensionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Launch the worker (or build the mock extension) and wait until it
    /// is ready.
    ///
    /// Transactional: either a fully-ready client comes back, or an
    /// error with no child process left alive and no port bound.
    pub fn start(self) -> Result<Client, BridgeError> {
        let ClientBuilder {
            mut descriptor,
            registry,
        } = self;

        if descriptor.host == MOCK_HOST {
            let extension = mock::instantiate(&registry, &descriptor.module, &descriptor.options)?;
            return Ok(Client::assemble(descriptor, Backend::Mock { extension }));
        }

        let mut relaunched = false;
        loop {
            descriptor.port = port::reserve().map_err(|err| BridgeError::WorkerStartFailed {
                reason: format!("could not reserve a loopback port: {:#}", err),
                stderr: String::new(),
            })?;
            let mut process =
                WorkerProcess::spawn(&descriptor).map_err(|err| BridgeError::WorkerStartFailed {
                    reason: format!("{:#}", err),
                    stderr: String::new(),
                })?;

            if let Err(err) = process.wait_ready(&descriptor) {
                if !relaunched && launcher::is_bind_failure(&err) {
                    debug!("worker lost the port-reserve race; relaunching with a fresh port");
                    relaunched = true;
                    continue;
                }
                return Err(err);
            }

            let mut transport =
                match HttpTransport::open(&descriptor.host, descriptor.port, descriptor.call_timeout)
                {
                    Ok(transport) => transport,
                    Err(err) => {
                        return Err(process
                            .start_failure(format!("could not open the transport: {:#}", err), descriptor.protocol));
                    }
                };

            // TCP readiness is not enough; confirm the HTTP layer with a
            // no-op request before handing the client out.
            let warmup = match codec::encode_request(&Request::ping(0), descriptor.protocol) {
                Ok(frame) => frame,
                Err(err) => {
                    return Err(process
                        .start_failure(format!("could not encode the warm-up request: {}", err), descriptor.protocol));
                }
            };
            transport.set_timeout(Some(descriptor.readiness_deadline));
            if let Err(err) = transport.roundtrip(&warmup) {
                return Err(process
                    .start_failure(format!("warm-up request failed: {}", err), descriptor.protocol));
            }
            transport.set_timeout(descriptor.call_timeout);

            info!(
                "worker for module '{}' ready on {}:{}",
                descriptor.module, descriptor.host, descriptor.port
            );
            return Ok(Client::assemble(
                descriptor,
                Backend::Remote { transport, process },
            ));
        }
    }
}

enum Backend {
    Remote {
        transport: HttpTransport,
        process: WorkerProcess,
    },
    Mock {
        extension: Box<dyn commons::dispatch::Dispatchable>,
    },
    Stopped,
}

/// A ready worker, driven through `call` and released with `shutdown`.
///
/// At most one call is in flight per client; the `&mut` receivers
/// enforce it. Dropping the client runs the shutdown path if it has not
/// run already.
pub struct Client {
    descriptor: WorkerDescriptor,
    backend: Backend,
    seq: u64,
    transport_failures: u32,
    residual_captures: Option<(Vec<u8>, Vec<u8>)>,
}

impl Client {
    fn assemble(descriptor: WorkerDescriptor, backend: Backend) -> Self {
        Client {
            descriptor,
            backend,
            seq: 1,
            transport_failures: 0,
            residual_captures: None,
        }
    }

    /// The descriptor this client was started with (port included).
    pub fn descriptor(&self) -> &WorkerDescriptor {
        &self.descriptor
    }

    /// Invoke `method` on the worker extension with positional
    /// arguments.
    pub fn call(&mut self, method: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.call_with(method, args, ValueMap::new())
    }

    /// Invoke `method` with positional and keyword arguments.
    pub fn call_with(
        &mut self,
        method: &str,
        args: Vec<Value>,
        kwargs: ValueMap,
    ) -> Result<Value, BridgeError> {
        let seq = self.next_seq();
        let protocol = self.descriptor.protocol;
        debug!("call #{} '{}'", seq, method);
        let request = Request::new(seq, method, args, kwargs);

        let outcome = match &mut self.backend {
            Backend::Stopped => return Err(BridgeError::WorkerStopped),
            Backend::Mock { extension } => {
                return match dispatch(extension.as_mut(), &request) {
                    Response::Ok(value) => Ok(value),
                    Response::Fault(frame) => Err(frame.into()),
                };
            }
            Backend::Remote { transport, .. } => {
                let frame = codec::encode_request(&request, protocol)?;
                transport.roundtrip(&frame).and_then(|body| {
                    codec::decode_response(&body, protocol).map_err(BridgeError::from)
                })
            }
        };

        match outcome {
            Ok(Response::Ok(value)) => {
                self.transport_failures = 0;
                Ok(value)
            }
            Ok(Response::Fault(frame)) => {
                self.transport_failures = 0;
                Err(frame.into())
            }
            Err(err) => {
                if let BridgeError::Transport(_) = err {
                    self.transport_failures += 1;
                    if self.transport_failures >= 2 {
                        warn!("two consecutive transport failures; tearing the worker down");
                        self.teardown();
                    }
                }
                Err(err)
            }
        }
    }

    /// Stop the worker and hand back its captured stdout and stderr.
    ///
    /// Idempotent: the first call returns the captures, later calls
    /// return empty streams. The worker gets the orderly-shutdown
    /// request first, then the grace/terminate/kill ladder regardless of
    /// whether it answered.
    pub fn shutdown(&mut self) -> Result<(Cursor<Vec<u8>>, Cursor<Vec<u8>>), BridgeError> {
        let seq = self.next_seq();
        let grace = self.descriptor.grace;
        let kill = self.descriptor.kill;
        let protocol = self.descriptor.protocol;

        match std::mem::replace(&mut self.backend, Backend::Stopped) {
            Backend::Stopped => {
                let (out, err) = self.residual_captures.take().unwrap_or_default();
                Ok((Cursor::new(out), Cursor::new(err)))
            }
            Backend::Mock { mut extension } => {
                let farewell = extension.before_shutdown();
                debug!("mock extension shut down (hook returned {})", farewell.kind());
                Ok((Cursor::new(Vec::new()), Cursor::new(Vec::new())))
            }
            Backend::Remote {
                mut transport,
                mut process,
            } => {
                transport.set_timeout(Some(grace));
                match codec::encode_request(&Request::shutdown(seq), protocol) {
                    Ok(frame) => {
                        if let Err(err) = transport.roundtrip(&frame) {
                            debug!(
                                "shutdown request failed ({}); proceeding on the shutdown schedule",
                                err
                            );
                        }
                    }
                    Err(err) => debug!("could not encode the shutdown request: {}", err),
                }
                let status = process.terminate(grace, kill).map_err(|err| {
                    BridgeError::Transport(format!("could not reap the worker: {:#}", err))
                })?;
                let (out, err) = process.take_streams();
                info!("worker exited with {}", status);
                Ok((Cursor::new(out), Cursor::new(err)))
            }
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn teardown(&mut self) {
        if let Backend::Remote { mut process, .. } =
            std::mem::replace(&mut self.backend, Backend::Stopped)
        {
            self.residual_captures = Some(process.abort());
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("descriptor", &self.descriptor)
            .field("seq", &self.seq)
            .field("transport_failures", &self.transport_failures)
            .finish()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if !matches!(self.backend, Backend::Stopped) {
            if let Err(err) = self.shutdown() {
                warn!("shutdown during drop failed: {}", err);
            }
        }
    }
}
