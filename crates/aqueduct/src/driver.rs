use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use aqueduct_concurrent::{ManyToOneQueue, OneToOneQueue};
use signal_hook::{
    consts::{SIGINT, SIGQUIT, SIGTERM},
    flag as signal_flag,
};
use tracing::info;

use crate::{
    DriverError,
    agent::{AgentConfig, CompositeAgent, start_agent},
    conductor::DriverConductor,
    context::{DriverContext, ThreadingMode},
    control_file::ControlFile,
    proxy::{CommandProxy, ConductorProxy},
    receiver::ReceiverAgent,
    sender::SenderAgent,
    system_counters::SystemCounters,
};

const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// A running media driver: the control file plus the agent threads laid out
/// by the configured threading mode.
pub struct MediaDriver {
    context: DriverContext,
    control_file: ControlFile,
    stop_flag: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl MediaDriver {
    pub fn launch(context: DriverContext) -> Result<Self, DriverError> {
        if context.dir_delete_on_start {
            let _ = std::fs::remove_dir_all(&context.dir);
        }
        std::fs::create_dir_all(context.dir.join("publications"))?;
        std::fs::create_dir_all(context.dir.join("images"))?;

        let control_file = ControlFile::create(&context)?;
        let to_driver = control_file.to_driver_ring()?;
        let to_clients = control_file.to_clients_transmitter()?;
        let mut counters_manager = control_file.counters_manager();
        let system = SystemCounters::allocate(&mut counters_manager)?;
        let error_log = control_file.error_log();

        let sender_queue = Arc::new(OneToOneQueue::with_capacity(COMMAND_QUEUE_CAPACITY));
        let receiver_queue = Arc::new(OneToOneQueue::with_capacity(COMMAND_QUEUE_CAPACITY));
        let conductor_queue = Arc::new(ManyToOneQueue::with_capacity(COMMAND_QUEUE_CAPACITY));

        let conductor = DriverConductor::new(
            context.clone(),
            to_driver,
            to_clients,
            counters_manager,
            system,
            error_log,
            CommandProxy::new(sender_queue.clone(), system),
            CommandProxy::new(receiver_queue.clone(), system),
            conductor_queue.clone(),
        );
        let sender = SenderAgent::new(sender_queue, system, context.clock.clone())?;
        let receiver = ReceiverAgent::new(
            receiver_queue,
            ConductorProxy::new(conductor_queue, system),
            system,
            context.clock.clone(),
        )?;

        let stop_flag = Arc::new(AtomicUsize::new(0));
        for signal in [SIGINT, SIGTERM, SIGQUIT] {
            signal_flag::register_usize(signal, Arc::clone(&stop_flag), signal as usize)
                .map_err(DriverError::Io)?;
        }

        info!(dir = %context.dir.display(), mode = ?context.threading_mode, "media driver launched");

        let handles = match context.threading_mode {
            ThreadingMode::Dedicated => vec![
                start_agent(
                    conductor,
                    AgentConfig { idle: context.conductor_idle, ..AgentConfig::default() },
                    stop_flag.clone(),
                ),
                start_agent(
                    sender,
                    AgentConfig { idle: context.sender_idle, ..AgentConfig::default() },
                    stop_flag.clone(),
                ),
                start_agent(
                    receiver,
                    AgentConfig { idle: context.receiver_idle, ..AgentConfig::default() },
                    stop_flag.clone(),
                ),
            ],
            ThreadingMode::SharedNetwork => vec![
                start_agent(
                    conductor,
                    AgentConfig { idle: context.conductor_idle, ..AgentConfig::default() },
                    stop_flag.clone(),
                ),
                start_agent(
                    CompositeAgent::new("network", vec![Box::new(sender), Box::new(receiver)]),
                    AgentConfig { idle: context.sender_idle, ..AgentConfig::default() },
                    stop_flag.clone(),
                ),
            ],
            ThreadingMode::Shared => vec![start_agent(
                CompositeAgent::new(
                    "driver",
                    vec![Box::new(conductor), Box::new(sender), Box::new(receiver)],
                ),
                AgentConfig { idle: context.conductor_idle, ..AgentConfig::default() },
                stop_flag.clone(),
            )],
        };

        Ok(Self { context, control_file, stop_flag, handles })
    }

    #[inline]
    pub fn context(&self) -> &DriverContext {
        &self.context
    }

    /// Requests a cooperative stop and blocks until every agent has torn
    /// down, then unlinks the control file.
    pub fn shutdown(mut self) {
        self.stop_flag.store(SIGTERM as usize, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        self.control_file.unlink();
        info!("media driver shut down");
    }

    /// Blocks until an external signal stops the driver.
    pub fn run_until_signalled(self) {
        while self.stop_flag.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
        self.shutdown();
    }
}
