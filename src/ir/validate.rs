//! Structural validation of function bodies
//!
//! Every later stage assumes well-formed blocks. A function failing validation is
//! rejected on its own; the rest of the program is still analysed.

use super::*;
use crate::error::IrError;

/// Check the structural invariants of one function
///
/// Declarations are always valid.
pub fn validate_function(program: &Program, func: FuncId) -> Result<(), IrError> {
    let function = program.function(func);
    let name = || function.name.clone();

    for &block in &function.blocks {
        let insts = &program.block(block).insts;
        let Some((&last, body)) = insts.split_last() else {
            return Err(IrError::MissingTerminator {
                name: name(),
                block,
            });
        };
        if !program.kind(last).is_terminator() {
            return Err(IrError::MissingTerminator {
                name: name(),
                block,
            });
        }
        if let Some(&inst) = body.iter().find(|i| program.kind(**i).is_terminator()) {
            return Err(IrError::MisplacedTerminator {
                name: name(),
                block,
                inst,
            });
        }

        for &inst in insts {
            let kind = program.kind(inst);
            for target in kind.successors() {
                let owned = (target.0 as usize) < program.blocks.len()
                    && program.block(target).func == func;
                if !owned {
                    return Err(IrError::ForeignSuccessor {
                        name: name(),
                        inst,
                        target,
                    });
                }
            }
            for operand in kind.operands() {
                match operand {
                    Value::Inst(used) if program.function_of(used) != func => {
                        return Err(IrError::ForeignOperand {
                            name: name(),
                            inst,
                            operand: used,
                        });
                    }
                    Value::Arg { func: owner, index }
                        if owner != func || index as usize >= function.params.len() =>
                    {
                        return Err(IrError::BadArgument {
                            name: name(),
                            inst,
                            owner,
                        });
                    }
                    _ => {}
                }
            }
            if let InstKind::Phi { incoming } = kind {
                let preds = program.predecessors(block);
                if let Some((from, _)) = incoming.iter().find(|(from, _)| !preds.contains(from)) {
                    return Err(IrError::BadPhiIncoming {
                        name: name(),
                        inst,
                        block: *from,
                    });
                }
            }
        }
    }
    Ok(())
}
