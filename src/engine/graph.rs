use crate::core::{Result, SagaError};
use crate::definition::{RecoveryPolicy, SagaDefinition, SagaRequest};
use std::collections::HashMap;
use std::collections::VecDeque;

/// A request plus its resolved edges.
#[derive(Debug, Clone)]
pub struct SagaNode {
    pub request: SagaRequest,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    /// Length of the longest parent chain above this node.
    pub stage: usize,
}

/// Arena form of a [`SagaDefinition`]. Nodes are addressed by index; stages
/// group nodes whose parents all sit in earlier stages.
#[derive(Debug, Clone)]
pub struct SagaGraph {
    policy: RecoveryPolicy,
    nodes: Vec<SagaNode>,
    index: HashMap<String, usize>,
    stages: Vec<Vec<usize>>,
}

impl SagaGraph {
    pub fn build(definition: &SagaDefinition) -> Result<Self> {
        let mut index = HashMap::with_capacity(definition.requests.len());
        for (idx, request) in definition.requests.iter().enumerate() {
            if index.insert(request.id.clone(), idx).is_some() {
                return Err(SagaError::InvalidDefinition(format!(
                    "duplicate request id '{}'",
                    request.id
                )));
            }
        }

        let mut nodes: Vec<SagaNode> = definition
            .requests
            .iter()
            .map(|request| SagaNode {
                request: request.clone(),
                parents: Vec::new(),
                children: Vec::new(),
                stage: 0,
            })
            .collect();

        for idx in 0..nodes.len() {
            let parent_ids = nodes[idx].request.parents.clone();
            for parent_id in parent_ids {
                let parent = *index.get(&parent_id).ok_or_else(|| {
                    SagaError::InvalidDefinition(format!(
                        "request '{}' depends on unknown request '{}'",
                        nodes[idx].request.id, parent_id
                    ))
                })?;
                if nodes[idx].parents.contains(&parent) {
                    continue;
                }
                nodes[idx].parents.push(parent);
                nodes[parent].children.push(idx);
            }
        }

        // Kahn's algorithm; anything left unvisited sits on a cycle.
        let mut pending: Vec<usize> = nodes.iter().map(|node| node.parents.len()).collect();
        let mut ready: VecDeque<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
        let mut visited = 0;
        while let Some(idx) = ready.pop_front() {
            visited += 1;
            let stage = nodes[idx].stage;
            for child in nodes[idx].children.clone() {
                nodes[child].stage = nodes[child].stage.max(stage + 1);
                pending[child] -= 1;
                if pending[child] == 0 {
                    ready.push_back(child);
                }
            }
        }
        if visited != nodes.len() {
            return Err(SagaError::InvalidDefinition(
                "saga requests form a dependency cycle".to_string(),
            ));
        }

        let depth = nodes.iter().map(|node| node.stage + 1).max().unwrap_or(0);
        let mut stages = vec![Vec::new(); depth];
        for (idx, node) in nodes.iter().enumerate() {
            stages[node.stage].push(idx);
        }

        Ok(Self {
            policy: definition.policy,
            nodes,
            index,
            stages,
        })
    }

    pub fn policy(&self) -> RecoveryPolicy {
        self.policy
    }

    pub fn node(&self, idx: usize) -> &SagaNode {
        &self.nodes[idx]
    }

    pub fn nodes(&self) -> &[SagaNode] {
        &self.nodes
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Stages in topological order.
    pub fn stages(&self) -> &[Vec<usize>] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
