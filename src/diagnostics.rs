use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt::Write;
use std::time::Duration;

use crate::Orchestrator;
use crate::core::TaskId;
use crate::engine::ParamRef;

/// Accumulated statistics for one unit.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub name: Cow<'static, str>,
    /// Completed invocations, fired or not.
    pub invocations: usize,
    pub fired: usize,
    /// Invocations that did not fire, including skipped and failed ones.
    pub skipped: usize,
    /// Time spent inside the unit's methods.
    pub duration: Duration,
}

impl TaskExecution {
    pub(crate) fn new(name: Cow<'static, str>) -> Self {
        Self {
            name,
            invocations: 0,
            fired: 0,
            skipped: 0,
            duration: Duration::ZERO,
        }
    }

    pub(crate) fn record(&mut self, fired: bool, duration: Duration) {
        self.invocations += 1;
        if fired {
            self.fired += 1;
        } else {
            self.skipped += 1;
        }
        self.duration += duration;
    }
}

/// Execution diagnostics and performance metrics.
///
/// Returned by [`Orchestrator::execute`], covers every unit registered so far.
#[derive(Debug, Default)]
pub struct Diagnostics {
    pub execution_times: HashMap<TaskId, TaskExecution>,
}

impl Diagnostics {
    /// Total invocations across all units.
    pub fn invocations(&self) -> usize {
        self.execution_times.values().map(|t| t.invocations).sum()
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by time spent.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Never invoked
    ///
    /// Edges into hidden (ordering-only) parameters are dotted.
    pub fn render_mermaid(&self, orchestrator: &Orchestrator) -> String {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let mut min_time = f64::MAX;
        let mut max_time = f64::MIN;

        for t in times.values().filter(|t| t.invocations > 0) {
            let secs = t.duration.as_secs_f64();
            min_time = min_time.min(secs);
            max_time = max_time.max(secs);
        }

        if min_time > max_time {
            min_time = 0.0;
            max_time = 0.0;
        }

        if (max_time - min_time).abs() < f64::EPSILON {
            max_time = min_time + 1.0;
        }

        orchestrator.with_nodes(|nodes| {
            for index in nodes.node_indices() {
                let node = &nodes[index];
                let name = node.name.replace('"', "\\\"");

                let executed = times
                    .get(&TaskId(index.index()))
                    .filter(|exec| exec.invocations > 0);

                let (label, color) = match executed {
                    Some(exec) => {
                        let t = (exec.duration.as_secs_f64() - min_time) / (max_time - min_time);

                        // Green -> Yellow -> Red
                        let (r, g) = if t < 0.5 {
                            ((255.0 * t * 2.0) as u8, 255)
                        } else {
                            (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
                        };

                        let label = format!(
                            "{:.2?} ({}/{})",
                            exec.duration, exec.fired, exec.invocations
                        );
                        (label, format!("#{r:02X}{g:02X}00"))
                    }
                    None => ("idle".to_string(), "#ADD8E6".to_string()),
                };

                let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, label);
                let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
            }

            for edge in nodes.edge_indices() {
                let Some((source, target)) = nodes.edge_endpoints(edge) else {
                    continue;
                };
                let type_name = nodes[source]
                    .task
                    .short_name()
                    .replace('<', "&lt;")
                    .replace('>', "&gt;");
                let arrow = match nodes[edge].target {
                    ParamRef::Arg(_) => "-->",
                    ParamRef::Hidden(_) => "-.->",
                };
                let _ = writeln!(
                    f,
                    "    {} -- \"{}\" {} {}",
                    source.index(),
                    type_name,
                    arrow,
                    target.index()
                );
            }
        });

        f
    }
}
