use std::collections::{HashMap, HashSet, VecDeque};

use super::{Block, DecisionBlock, EntryBlock, RawProgram, ToolBlock, TriggerKind};
use crate::error::ValidationError;

/// Validated, immutable block arena.
///
/// Invariants hold from construction on and are never re-checked: ids are unique, every
/// successor and tool binding resolves (bindings to a tool block of the bound kind), at least
/// one `onStart` entry exists and every agent block offers at least one tool.
#[derive(Debug, Clone)]
pub struct Program {
    agent_id: String,
    blocks: Vec<Block>,
    index: HashMap<String, usize>,
}

impl Program {
    pub fn validate(raw: RawProgram) -> Result<Self, ValidationError> {
        let RawProgram { agent_id, blocks } = raw;
        if blocks.is_empty() {
            return Err(ValidationError::EmptyProgram);
        }

        let has_start = blocks
            .iter()
            .any(|b| matches!(b, Block::Entry(e) if e.trigger == TriggerKind::OnStart));
        if !has_start {
            return Err(ValidationError::MissingStartEntry);
        }

        let mut index = HashMap::with_capacity(blocks.len());
        for (i, block) in blocks.iter().enumerate() {
            if index.insert(block.id().to_string(), i).is_some() {
                return Err(ValidationError::DuplicateBlockId(block.id().to_string()));
            }
        }

        for block in &blocks {
            match block {
                Block::Entry(EntryBlock { id, next, .. }) | Block::Tool(ToolBlock { id, next, .. }) => {
                    if let Some(target) = next
                        && !index.contains_key(target)
                    {
                        return Err(ValidationError::DanglingSuccessor {
                            block: id.clone(),
                            target: target.clone(),
                        });
                    }
                }
                Block::Decision(decision) => {
                    if decision.bindings.is_empty() {
                        return Err(ValidationError::NoToolBindings(decision.id.clone()));
                    }
                    for binding in &decision.bindings {
                        let Some(&i) = index.get(&binding.tool_id) else {
                            return Err(ValidationError::DanglingToolBinding {
                                block: decision.id.clone(),
                                target: binding.tool_id.clone(),
                            });
                        };
                        match &blocks[i] {
                            Block::Tool(tool) if tool.kind == binding.tool_name => {}
                            _ => {
                                return Err(ValidationError::BindingTargetMismatch {
                                    block: decision.id.clone(),
                                    tool: binding.tool_name.to_string(),
                                    target: binding.tool_id.clone(),
                                });
                            }
                        }
                    }
                }
            }
        }

        Ok(Self {
            agent_id,
            blocks,
            index,
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.index.get(id).map(|&i| &self.blocks[i])
    }

    pub fn decision_block(&self, id: &str) -> Option<&DecisionBlock> {
        match self.block(id)? {
            Block::Decision(b) => Some(b),
            _ => None,
        }
    }

    pub fn tool_block(&self, id: &str) -> Option<&ToolBlock> {
        match self.block(id)? {
            Block::Tool(b) => Some(b),
            _ => None,
        }
    }

    /// First entry block listening for `trigger`, in authoring order.
    pub fn entry_for(&self, trigger: TriggerKind) -> Option<&EntryBlock> {
        self.blocks.iter().find_map(|b| match b {
            Block::Entry(e) if e.trigger == trigger => Some(e),
            _ => None,
        })
    }

    pub fn start_entry(&self) -> &EntryBlock {
        // Presence is a construction invariant; an empty match here would be a bug in `validate`.
        self.entry_for(TriggerKind::OnStart)
            .unwrap_or_else(|| unreachable!("validated program without onStart entry"))
    }

    /// Ids reachable from the `onStart` entry (inclusive), breadth-first.
    pub fn reachable_from_start(&self) -> Vec<&str> {
        let start = self.start_entry().id.as_str();
        let mut seen = HashSet::from([start]);
        let mut order = vec![start];
        let mut queue = VecDeque::from([start]);

        while let Some(id) = queue.pop_front() {
            let Some(block) = self.block(id) else {
                continue;
            };
            for next in block.references() {
                if seen.insert(next) {
                    order.push(next);
                    queue.push_back(next);
                }
            }
        }
        order
    }
}

impl TryFrom<RawProgram> for Program {
    type Error = ValidationError;

    fn try_from(raw: RawProgram) -> Result<Self, Self::Error> {
        Self::validate(raw)
    }
}
