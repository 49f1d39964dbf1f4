use std::sync::Mutex;
use std::time::{Duration, Instant};

#[cfg(feature = "cli")]
use sysinfo::{Pid, System};

#[derive(Debug, Clone)]
pub struct PhaseTiming {
    pub phase: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessStats {
    pub cpu_usage: f32,
    pub memory_usage_mb: u64,
    pub peak_memory_mb: u64,
}

/// Tracks how long each ingestion phase took and, when built with the `cli`
/// feature, the memory footprint of the process at each phase boundary.
pub struct RunMonitor {
    enabled: bool,
    start_time: Mutex<Instant>,
    phase_start: Mutex<Instant>,
    timings: Mutex<Vec<PhaseTiming>>,
    peak_memory: Mutex<u64>,
    #[cfg(feature = "cli")]
    system: Option<(Mutex<System>, Pid)>,
}

impl RunMonitor {
    pub fn new(enabled: bool) -> Self {
        #[cfg(feature = "cli")]
        let system = if enabled {
            match sysinfo::get_current_pid() {
                Ok(pid) => {
                    let mut system = System::new();
                    system.refresh_all();
                    Some((Mutex::new(system), pid))
                }
                Err(e) => {
                    tracing::warn!("Process stats unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let now = Instant::now();
        Self {
            enabled,
            start_time: Mutex::new(now),
            phase_start: Mutex::new(now),
            timings: Mutex::new(Vec::new()),
            peak_memory: Mutex::new(0),
            #[cfg(feature = "cli")]
            system,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Starts a fresh run: clears earlier timings and restarts both clocks.
    pub fn start_run(&self) {
        let now = Instant::now();
        if let Ok(mut start) = self.start_time.lock() {
            *start = now;
        }
        if let Ok(mut phase_start) = self.phase_start.lock() {
            *phase_start = now;
        }
        if let Ok(mut timings) = self.timings.lock() {
            timings.clear();
        }
    }

    /// Closes the current phase and starts timing the next one.
    pub fn end_phase(&self, phase: &str) {
        let elapsed = match self.phase_start.lock() {
            Ok(mut start) => {
                let elapsed = start.elapsed();
                *start = Instant::now();
                elapsed
            }
            Err(_) => return,
        };

        if let Ok(mut timings) = self.timings.lock() {
            timings.push(PhaseTiming {
                phase: phase.to_string(),
                elapsed,
            });
        }

        if !self.enabled {
            return;
        }

        match self.process_stats() {
            Some(stats) => tracing::info!(
                "📊 {} took {:?} - CPU: {:.1}%, Memory: {}MB, Peak: {}MB",
                phase,
                elapsed,
                stats.cpu_usage,
                stats.memory_usage_mb,
                stats.peak_memory_mb
            ),
            None => tracing::info!("📊 {} took {:?}", phase, elapsed),
        }
    }

    pub fn timings(&self) -> Vec<PhaseTiming> {
        self.timings
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }

    pub fn total_elapsed(&self) -> Duration {
        self.start_time
            .lock()
            .map(|start| start.elapsed())
            .unwrap_or_default()
    }

    #[cfg(feature = "cli")]
    pub fn process_stats(&self) -> Option<ProcessStats> {
        let (system, pid) = self.system.as_ref()?;
        let mut system = system.lock().ok()?;
        system.refresh_all();
        let process = system.process(*pid)?;
        let memory_mb = process.memory() / 1024 / 1024;

        let mut peak = self.peak_memory.lock().ok()?;
        *peak = (*peak).max(memory_mb);

        Some(ProcessStats {
            cpu_usage: process.cpu_usage(),
            memory_usage_mb: memory_mb,
            peak_memory_mb: *peak,
        })
    }

    #[cfg(not(feature = "cli"))]
    pub fn process_stats(&self) -> Option<ProcessStats> {
        let _ = &self.peak_memory;
        None
    }

    pub fn log_final_stats(&self) {
        if !self.is_enabled() {
            return;
        }
        let peak = self.peak_memory.lock().map(|p| *p).unwrap_or(0);
        tracing::info!(
            "📊 Final Stats - Total Time: {:?}, Peak Memory: {}MB",
            self.total_elapsed(),
            peak
        );
    }
}

impl Default for RunMonitor {
    fn default() -> Self {
        Self::new(false)
    }
}
