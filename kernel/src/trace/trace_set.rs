//! Trace sets: level-filtered diagnostic output for simulation objects
//!
//! A trace set has a level, an output and a format. Objects attach to any
//! number of sets; a trace call at level `L` is written to every attached
//! set whose level is `<= L`. Output goes to the set's own writer, or to the
//! simulation's default trace output when the set has none.

use crate::core::config::{TraceFormat, TraceSetConfig};
use crate::core::error::SimError;
use crate::sim::simulation::Simulation;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::backtrace::Backtrace;
use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;
use uuid::Uuid;

/// Writer shared between trace sets and simulations
pub type SharedWriter = Arc<Mutex<dyn Write + Send>>;

/// One trace line in `TraceFormat::JsonLines` output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceRecord {
    pub run_id: Uuid,
    pub trace_set: String,
    pub level: i32,
    pub object: String,
    pub interned: bool,
    pub tick: i64,
    pub time: f64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stack: Vec<String>,
}

/// Capture the calling thread's stack as one string per frame
///
/// `limit == 0` keeps every frame.
pub(crate) fn capture_stack(limit: usize) -> Vec<String> {
    let rendered = Backtrace::force_capture().to_string();
    let mut frames: Vec<String> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim_start();
        let starts_frame = trimmed
            .split_once(':')
            .map(|(index, _)| !index.is_empty() && index.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false);
        if starts_frame {
            frames.push(trimmed.to_string());
        } else if let Some(last) = frames.last_mut() {
            last.push(' ');
            last.push_str(trimmed);
        }
    }
    if limit > 0 {
        frames.truncate(limit);
    }
    frames
}

struct TraceSetState {
    level: i32,
    stack_trace_mode: bool,
    stack_trace_limit: usize,
    format: TraceFormat,
    output: Option<SharedWriter>,
}

struct TraceSetInner {
    name: String,
    sim: Simulation,
    state: Mutex<TraceSetState>,
}

/// Handle to a trace set; clones refer to the same set
#[derive(Clone)]
pub struct TraceSet {
    inner: Arc<TraceSetInner>,
}

impl TraceSet {
    /// Create a trace set at level 0 with text output
    ///
    /// An interned set is registered in the simulation's name table.
    pub fn new(sim: &Simulation, name: Option<&str>, intern: bool) -> Result<Self, SimError> {
        Self::from_config(sim, name, intern, &TraceSetConfig::default())
    }

    pub fn from_config(
        sim: &Simulation,
        name: Option<&str>,
        intern: bool,
        config: &TraceSetConfig,
    ) -> Result<Self, SimError> {
        config.validate()?;
        let name = match name {
            Some(name) => name.to_string(),
            None => sim.generate_name("traceSet"),
        };
        let set = Self {
            inner: Arc::new(TraceSetInner {
                name: name.clone(),
                sim: sim.clone(),
                state: Mutex::new(TraceSetState {
                    level: config.level,
                    stack_trace_mode: config.stack_trace_mode,
                    stack_trace_limit: config.stack_trace_limit,
                    format: config.format,
                    output: None,
                }),
            }),
        };
        if intern {
            sim.register(&name, Arc::new(set.clone()))?;
        }
        Ok(set)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn simulation(&self) -> &Simulation {
        &self.inner.sim
    }

    pub fn level(&self) -> i32 {
        self.inner.state.lock().level
    }

    pub fn set_level(&self, level: i32) {
        self.inner.state.lock().level = level;
    }

    pub fn format(&self) -> TraceFormat {
        self.inner.state.lock().format
    }

    pub fn set_format(&self, format: TraceFormat) {
        self.inner.state.lock().format = format;
    }

    pub fn stack_trace_mode(&self) -> bool {
        self.inner.state.lock().stack_trace_mode
    }

    pub fn set_stack_trace_mode(&self, mode: bool) {
        self.inner.state.lock().stack_trace_mode = mode;
    }

    pub fn stack_trace_limit(&self) -> usize {
        self.inner.state.lock().stack_trace_limit
    }

    /// Limit the frames written in stack-trace mode; 0 means unlimited
    pub fn set_stack_trace_limit(&self, limit: i64) -> Result<(), SimError> {
        let limit = usize::try_from(limit).map_err(|_| {
            SimError::InvalidArgument(format!("stack trace limit must be non-negative, got {}", limit))
        })?;
        self.inner.state.lock().stack_trace_limit = limit;
        Ok(())
    }

    pub fn set_output<W>(&self, writer: W)
    where
        W: Write + Send + 'static,
    {
        self.set_shared_output(Arc::new(Mutex::new(writer)));
    }

    pub fn set_shared_output(&self, writer: SharedWriter) {
        self.inner.state.lock().output = Some(writer);
    }

    /// Fall back to the simulation's default trace output
    pub fn clear_output(&self) {
        self.inner.state.lock().output = None;
    }

    /// True if a call at `level` passes this set's filter
    pub fn accepts(&self, level: i32) -> bool {
        self.inner.state.lock().level <= level
    }

    pub fn ptr_eq(&self, other: &TraceSet) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Write one trace line for `object` if `level` passes the filter
    ///
    /// Returns whether anything was written.
    pub(crate) fn emit(
        &self,
        object: &str,
        interned: bool,
        level: i32,
        message: &fmt::Arguments<'_>,
    ) -> io::Result<bool> {
        let (stack_limit, stack_mode, format, own_output) = {
            let state = self.inner.state.lock();
            if state.level > level {
                return Ok(false);
            }
            (
                state.stack_trace_limit,
                state.stack_trace_mode,
                state.format,
                state.output.clone(),
            )
        };
        let output = match own_output.or_else(|| self.inner.sim.trace_output()) {
            Some(output) => output,
            None => return Ok(false),
        };

        let sim = &self.inner.sim;
        let tick = sim.current_ticks();
        let time = sim.ticks_to_time(tick);
        let stack = if stack_mode {
            capture_stack(stack_limit)
        } else {
            Vec::new()
        };

        let mut out = output.lock();
        match format {
            TraceFormat::Text => {
                writeln!(out, "[<{}> {} @ {} ({})]: {}", level, object, tick, time, message)?;
                for frame in &stack {
                    writeln!(out, "    {}", frame)?;
                }
            }
            TraceFormat::JsonLines => {
                let record = TraceRecord {
                    run_id: sim.run_id(),
                    trace_set: self.inner.name.clone(),
                    level,
                    object: object.to_string(),
                    interned,
                    tick,
                    time,
                    message: message.to_string(),
                    stack,
                };
                serde_json::to_writer(&mut *out, &record).map_err(io::Error::from)?;
                writeln!(out)?;
            }
        }
        out.flush()?;
        Ok(true)
    }
}

impl fmt::Debug for TraceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceSet")
            .field("name", &self.inner.name)
            .field("level", &self.level())
            .finish()
    }
}
