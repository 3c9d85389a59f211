use serde::Serialize;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::disasm::Instruction;
use crate::functions::DisasmFunction;
use crate::x86::whole_operand_literal;
use crate::xref::{Xref, XrefKind};

/// Basic blocks reference each other by dense id so cycles in the
/// successor and predecessor lists stay trivially representable.
#[derive(Default, Clone, Debug, Serialize)]
pub struct BasicBlock {
    pub id: usize,
    pub start_address: u64,
    pub end_address: u64,
    pub instructions: Vec<Instruction>,
    pub successors: Vec<usize>,
    pub predecessors: Vec<usize>,
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Loop {
    pub header_address: u64,
    pub back_edge_from_address: u64,
    pub depth: usize,
}

/// Decomposes one function into basic blocks with classified edges. The
/// instruction stream covers the whole section; only the function's range
/// is considered.
pub fn build_cfg(
    function: &DisasmFunction,
    instructions: &[Instruction],
    xref_map: &BTreeMap<u64, Vec<Xref>>,
) -> Vec<BasicBlock> {
    let body: Vec<&Instruction> = instructions
        .iter()
        .filter(|instruction| function.contains(instruction.address))
        .collect();

    if body.is_empty() {
        return Vec::new();
    }

    let leaders = collect_leaders(function, &body, xref_map);

    /* Carve blocks between consecutive leaders */
    let mut blocks: Vec<BasicBlock> = Vec::new();

    for instruction in body.iter() {
        if leaders.contains(&instruction.address) || blocks.is_empty() {
            blocks.push(BasicBlock {
                id: blocks.len(),
                start_address: instruction.address,
                end_address: instruction.end_address(),
                instructions: vec![(*instruction).clone()],
                successors: Vec::new(),
                predecessors: Vec::new(),
            });

            continue;
        }

        let Some(block) = blocks.last_mut() else {
            continue;
        };

        block.end_address = instruction.end_address();
        block.instructions.push((*instruction).clone());
    }

    let start_to_id: HashMap<u64, usize> = blocks
        .iter()
        .map(|block| (block.start_address, block.id))
        .collect();

    /* Edge classification from each block's terminator */
    let mut all_successors: Vec<Vec<usize>> = Vec::with_capacity(blocks.len());

    for block in blocks.iter() {
        all_successors.push(block_successors(block, &blocks, &start_to_id));
    }

    for (id, successors) in all_successors.into_iter().enumerate() {
        blocks[id].successors = successors;
    }

    /* Predecessors mirror successors */
    for id in 0..blocks.len() {
        for successor in blocks[id].successors.clone() {
            blocks[successor].predecessors.push(id);
        }
    }

    return blocks;
}

/*
 * Leader set: the entry, every in-function transfer target, and every
 * instruction following a transfer or a return. Calls do not split blocks.
 * Targets that fall between instructions are dropped so block bounds stay
 * aligned with the decoded stream.
 */
fn collect_leaders(
    function: &DisasmFunction,
    body: &[&Instruction],
    xref_map: &BTreeMap<u64, Vec<Xref>>,
) -> BTreeSet<u64> {
    let mut leaders: BTreeSet<u64> = BTreeSet::new();

    leaders.insert(body[0].address);

    for (i, instruction) in body.iter().enumerate() {
        let is_jmp = instruction.mnemonic == "jmp";
        let is_branch = instruction.is_branch();

        if is_jmp || is_branch {
            if let Some(target) = whole_operand_literal(&instruction.operands) {
                if function.contains(target) {
                    leaders.insert(target);
                }
            }
        }

        if (is_jmp || is_branch || instruction.is_return()) && i + 1 < body.len() {
            leaders.insert(body[i + 1].address);
        }
    }

    for (target, xrefs) in xref_map.iter() {
        if !function.contains(*target) {
            continue;
        }

        if xrefs
            .iter()
            .any(|xref| matches!(xref.kind, XrefKind::Jmp | XrefKind::Branch))
        {
            leaders.insert(*target);
        }
    }

    let instruction_addresses: BTreeSet<u64> =
        body.iter().map(|instruction| instruction.address).collect();

    return leaders
        .into_iter()
        .filter(|leader| instruction_addresses.contains(leader))
        .collect();
}

fn block_successors(
    block: &BasicBlock,
    blocks: &[BasicBlock],
    start_to_id: &HashMap<u64, usize>,
) -> Vec<usize> {
    let Some(last) = block.instructions.last() else {
        return Vec::new();
    };

    let mut successors: Vec<usize> = Vec::new();

    if last.is_return() {
        return successors;
    }

    if last.mnemonic == "jmp" {
        if let Some(target) = whole_operand_literal(&last.operands) {
            if let Some(target_id) = lookup_block(blocks, start_to_id, target) {
                successors.push(target_id);
            }
        }

        return successors;
    }

    if last.is_branch() {
        if let Some(target) = whole_operand_literal(&last.operands) {
            if let Some(target_id) = lookup_block(blocks, start_to_id, target) {
                successors.push(target_id);
            }
        }
    }

    if let Some(fallthrough_id) = start_to_id.get(&block.end_address) {
        successors.push(*fallthrough_id);
    }

    return successors;
}

fn lookup_block(
    blocks: &[BasicBlock],
    start_to_id: &HashMap<u64, usize>,
    target: u64,
) -> Option<usize> {
    if let Some(id) = start_to_id.get(&target) {
        return Some(*id);
    }

    return blocks
        .iter()
        .find(|block| target >= block.start_address && target < block.end_address)
        .map(|block| block.id);
}

/*
 * Natural loop detection over a block list. BFS layering from the entry;
 * any edge that does not move strictly deeper is a back edge and its
 * destination a loop header.
 */
pub fn detect_loops(blocks: &[BasicBlock]) -> Vec<Loop> {
    if blocks.is_empty() {
        return Vec::new();
    }

    let mut layers: Vec<Option<usize>> = vec![None; blocks.len()];
    let mut queue: VecDeque<usize> = VecDeque::new();

    layers[0] = Some(0);
    queue.push_back(0);

    while let Some(id) = queue.pop_front() {
        let Some(layer) = layers[id] else {
            continue;
        };

        for successor in blocks[id].successors.iter() {
            if layers[*successor].is_none() {
                layers[*successor] = Some(layer + 1);
                queue.push_back(*successor);
            }
        }
    }

    let mut loops: Vec<Loop> = Vec::new();
    let mut seen_headers: BTreeSet<u64> = BTreeSet::new();

    for block in blocks.iter() {
        let Some(source_layer) = layers[block.id] else {
            continue;
        };

        for successor in block.successors.iter() {
            let Some(target_layer) = layers[*successor] else {
                continue;
            };

            if target_layer > source_layer {
                continue;
            }

            let header_address = blocks[*successor].start_address;

            if seen_headers.insert(header_address) {
                loops.push(Loop {
                    header_address,
                    back_edge_from_address: block.end_address,
                    depth: 0,
                });
            }
        }
    }

    loops.sort_by_key(|l| l.header_address);

    /* Approximate nesting: a loop is nested in every other loop whose span
     * contains its header */
    let spans: Vec<(u64, u64)> = loops
        .iter()
        .map(|l| (l.header_address, l.back_edge_from_address))
        .collect();

    for (i, l) in loops.iter_mut().enumerate() {
        l.depth = spans
            .iter()
            .enumerate()
            .filter(|(j, (start, end))| {
                *j != i && l.header_address >= *start && l.header_address < *end
            })
            .count();
    }

    return loops;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruction(address: u64, size: usize, mnemonic: &str, operands: &str) -> Instruction {
        return Instruction {
            address,
            bytes: vec![0; size],
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            size,
            comment: None,
        };
    }

    fn function(address: u64, size: u64) -> DisasmFunction {
        return DisasmFunction {
            name: format!("sub_{:x}", address),
            address,
            size,
        };
    }

    #[test]
    fn straight_line_function_is_one_block_without_successors() {
        let instructions = vec![
            instruction(0x1000, 4, "sub", "rsp, 0x28"),
            instruction(0x1004, 5, "mov", "eax, 1"),
            instruction(0x1009, 4, "add", "rsp, 0x28"),
            instruction(0x100D, 1, "ret", ""),
        ];
        let map = crate::xref::build_xref_map(&instructions);

        let blocks = build_cfg(&function(0x1000, 14), &instructions, &map);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].start_address, 0x1000);
        assert_eq!(blocks[0].end_address, 0x100E);
        assert!(blocks[0].successors.is_empty());
        assert!(blocks[0].predecessors.is_empty());
    }

    #[test]
    fn conditional_back_branch_forms_a_loop() {
        let instructions = vec![
            instruction(0x10, 2, "mov", "eax, 1"),
            instruction(0x12, 2, "add", "eax, 1"),
            instruction(0x14, 2, "jne", "0x10"),
            instruction(0x16, 1, "ret", ""),
        ];
        let map = crate::xref::build_xref_map(&instructions);

        let blocks = build_cfg(&function(0x10, 7), &instructions, &map);

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].start_address, 0x10);
        assert_eq!(blocks[0].end_address, 0x16);
        assert_eq!(blocks[0].successors, vec![0, 1]);
        assert_eq!(blocks[1].start_address, 0x16);
        assert!(blocks[1].successors.is_empty());
        assert_eq!(blocks[0].predecessors, vec![0]);
        assert_eq!(blocks[1].predecessors, vec![0]);

        let loops = detect_loops(&blocks);

        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].header_address, 0x10);
        assert_eq!(loops[0].back_edge_from_address, 0x16);
        assert_eq!(loops[0].depth, 0);
    }

    #[test]
    fn calls_do_not_split_blocks() {
        let instructions = vec![
            instruction(0x1000, 5, "call", "0x2000"),
            instruction(0x1005, 5, "mov", "eax, 1"),
            instruction(0x100A, 1, "ret", ""),
        ];
        let map = crate::xref::build_xref_map(&instructions);

        let blocks = build_cfg(&function(0x1000, 11), &instructions, &map);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].instructions.len(), 3);
    }

    #[test]
    fn predecessors_are_the_inverse_of_successors() {
        let instructions = vec![
            instruction(0x10, 2, "cmp", "eax, 1"),
            instruction(0x12, 2, "je", "0x18"),
            instruction(0x14, 2, "mov", "eax, 2"),
            instruction(0x16, 2, "jmp", "0x1a"),
            instruction(0x18, 2, "mov", "eax, 3"),
            instruction(0x1A, 1, "ret", ""),
        ];
        let map = crate::xref::build_xref_map(&instructions);

        let blocks = build_cfg(&function(0x10, 11), &instructions, &map);

        for block in blocks.iter() {
            for successor in block.successors.iter() {
                assert!(blocks[*successor].predecessors.contains(&block.id));
            }

            for predecessor in block.predecessors.iter() {
                assert!(blocks[*predecessor].successors.contains(&block.id));
            }
        }

        /* Every in-function transfer lands on a block start */
        let starts: Vec<u64> = blocks.iter().map(|block| block.start_address).collect();

        assert!(starts.contains(&0x18));
        assert!(starts.contains(&0x1A));
    }

    #[test]
    fn nested_loops_get_increasing_depth() {
        let make_block = |id: usize, start: u64, end: u64, successors: Vec<usize>| BasicBlock {
            id,
            start_address: start,
            end_address: end,
            instructions: Vec::new(),
            successors,
            predecessors: Vec::new(),
        };

        let blocks = vec![
            make_block(0, 0x10, 0x20, vec![1]),
            make_block(1, 0x20, 0x30, vec![2]),
            make_block(2, 0x30, 0x38, vec![1, 3]),
            make_block(3, 0x38, 0x40, vec![0]),
        ];

        let loops = detect_loops(&blocks);

        assert_eq!(loops.len(), 2);
        assert_eq!(loops[0].header_address, 0x10);
        assert_eq!(loops[0].depth, 0);
        assert_eq!(loops[1].header_address, 0x20);
        assert_eq!(loops[1].depth, 1);
    }

    #[test]
    fn branch_to_fallthrough_yields_two_identical_successors() {
        let instructions = vec![
            instruction(0x10, 2, "jne", "0x12"),
            instruction(0x12, 1, "ret", ""),
        ];
        let map = crate::xref::build_xref_map(&instructions);

        let blocks = build_cfg(&function(0x10, 3), &instructions, &map);

        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].successors, vec![1, 1]);
    }
}
