use std::collections::HashMap;
use std::fmt::{Display, Formatter, Write};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::graph::NodeIndex;
use petgraph::visit::EdgeRef;

use crate::engine::{BuildGraph, Edge};
use crate::error::TaskError;

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What happened to each node during one run.
#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Nodes whose recipe actually ran, with timings.
    pub execution_times: HashMap<NodeIndex, TaskExecution>,
    /// Nodes whose journaled result was reused.
    pub reused: Vec<NodeIndex>,
    /// Nodes that did not complete.
    pub failed: HashMap<NodeIndex, Arc<TaskError>>,
}

impl Diagnostics {
    pub fn executed(&self) -> usize {
        self.execution_times.len()
    }

    pub fn was_executed(&self, index: NodeIndex) -> bool {
        self.execution_times.contains_key(&index)
    }

    /// Failures that started in the node itself, in graph order.
    pub fn origins(&self) -> Vec<Arc<TaskError>> {
        let mut origins: Vec<_> = self
            .failed
            .iter()
            .filter(|(_, e)| e.is_origin())
            .map(|(i, e)| (*i, e.clone()))
            .collect();
        origins.sort_by_key(|(i, _)| *i);
        origins.into_iter().map(|(_, e)| e).collect()
    }

    /// One-line summary for the end of a build.
    pub fn summary(&self) -> String {
        let total: Duration = self.execution_times.values().map(|t| t.duration).sum();
        format!(
            "{} executed, {} up to date, {} failed ({:.2?} of recipe time)",
            self.execution_times.len(),
            self.reused.len(),
            self.failed.len(),
            total
        )
    }

    /// Renders the task graph as a Mermaid diagram, color-coded by execution duration.
    ///
    /// * **Green**: Fast
    /// * **Yellow**: Moderate
    /// * **Red**: Slow
    /// * **Blue**: Reused from the journal
    /// * **Grey**: Failed or never reached
    pub fn render_mermaid<G>(&self, graph: &BuildGraph<G>) -> String
    where
        G: Send + Sync + 'static,
    {
        let mut f = String::new();
        let _ = writeln!(f, "graph LR");

        let times = &self.execution_times;
        let (min_time, max_time) = times
            .values()
            .map(|t| t.duration.as_secs_f64())
            .fold(None, |acc: Option<(f64, f64)>, secs| match acc {
                Some((lo, hi)) => Some((lo.min(secs), hi.max(secs))),
                None => Some((secs, secs)),
            })
            .unwrap_or((0.0, 0.0));

        // Avoid divide by zero if all tasks took same time
        let span = if (max_time - min_time).abs() < f64::EPSILON {
            1.0
        } else {
            max_time - min_time
        };

        for index in graph.graph.node_indices() {
            let slot = &graph.graph[index];
            let name = slot.label.replace('"', "\\\"");

            let (extra, color) = if let Some(exec) = times.get(&index) {
                let t = (exec.duration.as_secs_f64() - min_time) / span;
                (format!("{:.2?}", exec.duration), heat(t))
            } else if self.failed.contains_key(&index) {
                ("Failed".to_string(), "#D3D3D3".to_string())
            } else if self.reused.contains(&index) {
                ("Cached".to_string(), "#ADD8E6".to_string())
            } else {
                continue;
            };

            let _ = writeln!(f, "    {}[\"{}\\n{}\"]", index.index(), name, extra);
            let _ = writeln!(f, "    style {} fill:{}", index.index(), color);
        }

        for edge in graph.graph.edge_references() {
            let arrow = match edge.weight() {
                Edge::Data => "-->",
                Edge::Order => "-.->",
            };
            let _ = writeln!(
                f,
                "    {} {} {}",
                edge.source().index(),
                arrow,
                edge.target().index()
            );
        }

        f
    }
}

/// 0.0 (Green) -> 0.5 (Yellow) -> 1.0 (Red)
fn heat(t: f64) -> String {
    let t = t.clamp(0.0, 1.0);
    let (r, g) = if t < 0.5 {
        ((255.0 * t * 2.0) as u8, 255)
    } else {
        (255, (255.0 * (1.0 - (t - 0.5) * 2.0)) as u8)
    };
    format!("#{:02X}{:02X}00", r, g)
}

// WATERFALL

struct XmlSafe<'a>(&'a str);

impl Display for XmlSafe<'_> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        for c in self.0.chars() {
            match c {
                '<' => f.write_str("&lt;")?,
                '>' => f.write_str("&gt;")?,
                '&' => f.write_str("&amp;")?,
                '"' => f.write_str("&quot;")?,
                '\'' => f.write_str("&apos;")?,
                _ => f.write_char(c)?,
            }
        }
        Ok(())
    }
}

const ROW_HEIGHT: u32 = 24;
const LABEL_WIDTH: u32 = 360;
const CHART_WIDTH: u32 = 900;
const PADDING: u32 = 10;
const HEADER_HEIGHT: u32 = 30;

impl Diagnostics {
    /// Renders executed tasks on a timeline as an SVG document. External
    /// tool runs dominate a font build, so this is where parallelism (or the
    /// lack of it, along the weight chain) becomes visible.
    pub fn render_waterfall<G>(&self, graph: &BuildGraph<G>) -> String
    where
        G: Send + Sync + 'static,
    {
        let mut tasks: Vec<(NodeIndex, &TaskExecution)> =
            self.execution_times.iter().map(|(k, v)| (*k, v)).collect();
        tasks.sort_by_key(|(_, t)| t.start);

        let (Some(first), Some(end)) = (
            tasks.first(),
            tasks.iter().map(|(_, t)| t.start + t.duration).max(),
        ) else {
            return r#"<svg width="200" height="50" xmlns="http://www.w3.org/2000/svg"><text x="10" y="30" font-family="sans-serif">No tasks ran</text></svg>"#.to_string();
        };

        let origin = first.1.start;
        let total = end.duration_since(origin).as_micros().max(1) as f64;
        let width = LABEL_WIDTH + CHART_WIDTH + PADDING * 3;
        let height = HEADER_HEIGHT + tasks.len() as u32 * ROW_HEIGHT + PADDING;

        let mut svg = String::with_capacity(tasks.len() * 400);
        let _ = write!(
            svg,
            r#"<svg width="{width}" height="{height}" xmlns="http://www.w3.org/2000/svg"><style>text {{ font-family: sans-serif; font-size: 12px; }} .bar {{ fill: #3b82f6; }}</style><rect width="100%" height="100%" fill="white" />"#
        );

        for (i, (index, exec)) in tasks.iter().enumerate() {
            let y = HEADER_HEIGHT + i as u32 * ROW_HEIGHT;
            let offset = exec.start.duration_since(origin).as_micros() as f64;
            let x = (LABEL_WIDTH + PADDING * 2) as f64 + offset / total * CHART_WIDTH as f64;
            let w = (exec.duration.as_micros() as f64 / total * CHART_WIDTH as f64).max(1.0);
            let name = XmlSafe(&graph.graph[*index].label);

            let _ = write!(
                svg,
                r#"<text x="{PADDING}" y="{ty}">{name}</text><rect x="{x:.1}" y="{ry}" width="{w:.1}" height="{h}" class="bar"><title>{name}: {dur:.2?}</title></rect>"#,
                ty = y + ROW_HEIGHT / 2 + 4,
                ry = y + 4,
                h = ROW_HEIGHT - 8,
                dur = exec.duration,
            );
        }

        svg.push_str("</svg>");
        svg
    }
}
