use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::JoinHandle,
};

use aqueduct_concurrent::{IdleStrategy, Idler};
use aqueduct_utils::{ThreadPriority, thread_boot};
use tracing::{Level, info, span};

/// A cooperative duty-cycle agent. `do_work` returns the amount of work done
/// so the runner can idle proportionally; it must never block.
pub trait Agent: Send {
    fn do_work(&mut self) -> usize;

    /// Runs once on the agent's thread after the stop flag is observed.
    fn on_close(&mut self) {}

    fn name(&self) -> &'static str;
}

#[derive(Clone, Copy, Debug)]
pub struct AgentConfig {
    pub core: Option<usize>,
    pub thread_prio: ThreadPriority,
    pub idle: IdleStrategy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self { core: None, thread_prio: ThreadPriority::OSDefault, idle: IdleStrategy::default_backoff() }
    }
}

/// Runs agents round-robin on one thread; the composition's work count is
/// the sum, so the thread only idles when every member idled.
pub struct CompositeAgent {
    name: &'static str,
    agents: Vec<Box<dyn Agent>>,
}

impl CompositeAgent {
    pub fn new(name: &'static str, agents: Vec<Box<dyn Agent>>) -> Self {
        Self { name, agents }
    }
}

impl Agent for CompositeAgent {
    fn do_work(&mut self) -> usize {
        self.agents.iter_mut().map(|a| a.do_work()).sum()
    }

    fn on_close(&mut self) {
        for agent in &mut self.agents {
            agent.on_close();
        }
    }

    fn name(&self) -> &'static str {
        self.name
    }
}

/// Boots one agent thread: pins core/priority, runs the duty cycle until the
/// shared stop flag is raised, then tears the agent down on its own thread.
pub fn start_agent<A: Agent + 'static>(
    mut agent: A,
    config: AgentConfig,
    stop_flag: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(agent.name().to_string())
        .spawn(move || {
            let _span = span!(Level::INFO, "", agent = agent.name()).entered();
            thread_boot(config.core, config.thread_prio);
            info!("agent started");

            let mut idler = Idler::default();
            loop {
                let work_count = agent.do_work();
                if stop_flag.load(Ordering::Relaxed) != 0 {
                    break;
                }
                idler.idle(config.idle, work_count);
            }

            agent.on_close();
            info!("agent closed");
        })
        .expect("couldn't spawn agent thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingAgent {
        counter: Arc<AtomicUsize>,
        closed: Arc<AtomicUsize>,
    }

    impl Agent for CountingAgent {
        fn do_work(&mut self) -> usize {
            self.counter.fetch_add(1, Ordering::Relaxed);
            1
        }

        fn on_close(&mut self) {
            self.closed.fetch_add(1, Ordering::Relaxed);
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    #[test]
    fn runs_until_stopped_then_closes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicUsize::new(0));

        let handle = start_agent(
            CountingAgent { counter: counter.clone(), closed: closed.clone() },
            AgentConfig::default(),
            stop.clone(),
        );

        while counter.load(Ordering::Relaxed) < 10 {
            std::hint::spin_loop();
        }
        stop.store(1, Ordering::Relaxed);
        handle.join().unwrap();
        assert_eq!(closed.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn composite_sums_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));
        let mut composite = CompositeAgent::new(
            "both",
            vec![
                Box::new(CountingAgent { counter: counter.clone(), closed: closed.clone() }),
                Box::new(CountingAgent { counter: counter.clone(), closed: closed.clone() }),
            ],
        );
        assert_eq!(composite.do_work(), 2);
        composite.on_close();
        assert_eq!(closed.load(Ordering::Relaxed), 2);
    }
}
