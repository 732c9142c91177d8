//! Graph visualization: render a compiled graph as a Mermaid flowchart.
//!
//! The control plane serves this from `GET /pipeline/diagram` so operators
//! can see the routing structure, including conditional fan-outs.

use std::fmt::Write;

use super::conditional::NextEntry;
use super::state_graph::{END, START};
use super::CompiledGraph;

/// Generates a Mermaid `graph TD` representation of the compiled graph.
///
/// Unconditional edges render as solid arrows; conditional fan-outs render as
/// dotted arrows labeled with the routing key.
pub fn mermaid_diagram<S, U>(graph: &CompiledGraph<S, U>) -> String {
    let mut out = String::from("graph TD\n");
    let _ = writeln!(out, "    {}([start])", ident(START));
    let _ = writeln!(out, "    {}([end])", ident(END));

    let mut node_ids: Vec<&String> = graph.nodes.keys().collect();
    node_ids.sort();
    for id in &node_ids {
        let _ = writeln!(out, "    {}[{}]", ident(id), id);
    }

    let _ = writeln!(out, "    {} --> {}", ident(START), ident(&graph.entry));

    for id in &node_ids {
        match graph.next_map.get(id.as_str()) {
            Some(NextEntry::Unconditional(to)) => {
                let _ = writeln!(out, "    {} --> {}", ident(id), ident(to));
            }
            Some(NextEntry::Conditional(router)) => {
                if let Some(path_map) = &router.path_map {
                    let mut entries: Vec<(&String, &String)> = path_map.iter().collect();
                    entries.sort();
                    for (key, target) in entries {
                        let _ = writeln!(
                            out,
                            "    {} -.->|{}| {}",
                            ident(id),
                            key,
                            ident(target)
                        );
                    }
                }
            }
            None => {
                let _ = writeln!(out, "    {} --> {}", ident(id), ident(END));
            }
        }
    }
    out
}

/// Node ids mangled for Mermaid: alphanumerics and underscores only. The
/// sentinel underscores stay, which also keeps the id clear of Mermaid's
/// reserved word `end`.
fn ident(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;

    use crate::graph::{reducer_fn, GraphError, Node, RunContext, StateGraph};

    struct Noop(&'static str);

    #[async_trait]
    impl Node<u32, u32> for Noop {
        fn id(&self) -> &str {
            self.0
        }
        async fn run(&self, state: u32, _ctx: &RunContext) -> Result<u32, GraphError> {
            Ok(state)
        }
    }

    /// **Scenario**: The diagram names every node and both edge kinds.
    #[test]
    fn mermaid_renders_nodes_and_edges() {
        let mut graph = StateGraph::<u32, u32>::new();
        graph.add_node("research", Arc::new(Noop("research")));
        graph.add_node("generator", Arc::new(Noop("generator")));
        graph.add_edge(START, "research");
        graph.add_edge("research", "generator");
        graph.add_conditional_edges(
            "generator",
            Arc::new(|_| END.to_string()),
            Some(
                [
                    ("research".to_string(), "research".to_string()),
                    (END.to_string(), END.to_string()),
                ]
                .into_iter()
                .collect(),
            ),
        );
        let app = graph.compile(reducer_fn(|s: &mut u32, u| *s = u)).unwrap();
        let diagram = mermaid_diagram(&app);
        assert!(diagram.starts_with("graph TD"));
        assert!(diagram.contains("research[research]"));
        assert!(diagram.contains("research --> generator"));
        assert!(diagram.contains("generator -.->|research| research"));
        assert!(diagram.contains("generator -.->"));
    }
}
