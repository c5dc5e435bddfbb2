//! Textual IR, loosely following LLVM assembly syntax.

use std::fmt::{self, Write as _};

use crate::module::{Callee, Inst, Linkage, Terminator, ValueKind};
use crate::{BlockId, FunctionId, Module, ValueId};

impl Module {
    fn operand(&self, value: ValueId) -> String {
        let data = self.value(value);
        match &data.kind {
            ValueKind::Const(c) if self.types().is_ptr(data.ty) => {
                if c.is_zero() {
                    "null".to_string()
                } else {
                    format!("inttoptr (i{} {c} to ptr)", c.width())
                }
            }
            ValueKind::Const(c) => c.to_string(),
            ValueKind::Undef => "undef".to_string(),
            ValueKind::Function(f) => format!("@{}", self.function(*f).name),
            ValueKind::Global(g) => format!("@{}", self.global(*g).name),
            ValueKind::Param { index, .. } => match &data.name {
                Some(name) => format!("%{name}"),
                None => format!("%arg{index}"),
            },
            ValueKind::Inst { .. } => match &data.name {
                Some(name) => format!("%{name}.{}", value.raw()),
                None => format!("%{}", value.raw()),
            },
        }
    }

    fn typed(&self, value: ValueId) -> String {
        format!(
            "{} {}",
            self.types().display(self.value_type(value)),
            self.operand(value)
        )
    }

    fn block_label(&self, block: BlockId) -> String {
        format!("%{}.{}", self.block(block).name, block.raw())
    }

    fn write_inst(&self, out: &mut String, id: ValueId, inst: &Inst) -> fmt::Result {
        let ty = self.types().display(self.value_type(id));
        let lhs = self.operand(id);
        match inst {
            Inst::Binary { op, lhs: a, rhs: b } => {
                write!(out, "{lhs} = {} {}, {}", op.mnemonic(), self.typed(*a), self.operand(*b))
            }
            Inst::ICmp { pred, lhs: a, rhs: b } => write!(
                out,
                "{lhs} = icmp {} {}, {}",
                pred.mnemonic(),
                self.typed(*a),
                self.operand(*b)
            ),
            Inst::Cast { op, value } => {
                write!(out, "{lhs} = {} {} to {ty}", op.mnemonic(), self.typed(*value))
            }
            Inst::Select {
                cond,
                then_value,
                else_value,
            } => write!(
                out,
                "{lhs} = select {}, {}, {}",
                self.typed(*cond),
                self.typed(*then_value),
                self.typed(*else_value)
            ),
            Inst::Alloca { ty: slot, align } => write!(
                out,
                "{lhs} = alloca {}, align {align}",
                self.types().display(*slot)
            ),
            Inst::Load { ptr, align } => {
                write!(out, "{lhs} = load {ty}, {}, align {align}", self.typed(*ptr))
            }
            Inst::Store { value, ptr, align } => write!(
                out,
                "store {}, {}, align {align}",
                self.typed(*value),
                self.typed(*ptr)
            ),
            Inst::ByteOffset { base, offset } => write!(
                out,
                "{lhs} = getelementptr inbounds i8, {}, {}",
                self.typed(*base),
                self.typed(*offset)
            ),
            Inst::StructGep {
                base,
                struct_ty,
                index,
            } => write!(
                out,
                "{lhs} = getelementptr inbounds {}, {}, i32 0, i32 {index}",
                self.types().display(*struct_ty),
                self.typed(*base)
            ),
            Inst::MemCpy { dest, src, size } => write!(
                out,
                "call void @llvm.memcpy({}, {}, {})",
                self.typed(*dest),
                self.typed(*src),
                self.typed(*size)
            ),
            Inst::MemSet { dest, byte, size } => write!(
                out,
                "call void @llvm.memset({}, {}, {})",
                self.typed(*dest),
                self.typed(*byte),
                self.typed(*size)
            ),
            Inst::Call { callee, args } => {
                if !self.types().is_void(self.value_type(id)) {
                    write!(out, "{lhs} = ")?;
                }
                let target = match callee {
                    Callee::Direct(f) => format!("@{}", self.function(*f).name),
                    Callee::Indirect { ptr, .. } => self.operand(*ptr),
                };
                write!(out, "call {ty} {target}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    out.push_str(&self.typed(*arg));
                }
                out.push(')');
                Ok(())
            }
            Inst::Phi { incoming } => {
                write!(out, "{lhs} = phi {ty} ")?;
                for (i, (value, block)) in incoming.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    write!(out, "[ {}, {} ]", self.operand(*value), self.block_label(*block))?;
                }
                Ok(())
            }
        }
    }

    fn write_terminator(&self, out: &mut String, terminator: &Terminator) -> fmt::Result {
        match terminator {
            Terminator::Br(dest) => write!(out, "br label {}", self.block_label(*dest)),
            Terminator::CondBr {
                cond,
                then_block,
                else_block,
            } => write!(
                out,
                "br {}, label {}, label {}",
                self.typed(*cond),
                self.block_label(*then_block),
                self.block_label(*else_block)
            ),
            Terminator::Switch {
                value,
                default,
                cases,
            } => {
                write!(
                    out,
                    "switch {}, label {} [",
                    self.typed(*value),
                    self.block_label(*default)
                )?;
                let ty = self.types().display(self.value_type(*value));
                for (case, block) in cases {
                    write!(out, " {ty} {case}, label {}", self.block_label(*block))?;
                }
                out.push_str(" ]");
                Ok(())
            }
            Terminator::Ret(Some(value)) => write!(out, "ret {}", self.typed(*value)),
            Terminator::Ret(None) => write!(out, "ret void"),
            Terminator::Unreachable => write!(out, "unreachable"),
        }
    }

    /// Print one function.
    pub fn print_function(&self, function: FunctionId) -> String {
        let mut out = String::new();
        // Writing to a String cannot fail.
        let _ = self.write_function(&mut out, function);
        out
    }

    fn write_function(&self, out: &mut String, function: FunctionId) -> fmt::Result {
        let data = self.function(function);
        let (_, ret) = self.types().signature(data.ty);
        let keyword = if data.is_declaration() { "declare" } else { "define" };
        let linkage = match data.linkage {
            Linkage::External => "",
            Linkage::LinkOnceOdr => "linkonce_odr hidden ",
            Linkage::Internal => "internal ",
        };
        write!(
            out,
            "{keyword} {linkage}{} @{}(",
            self.types().display(ret),
            data.name
        )?;
        for (i, param) in data.params.iter().enumerate() {
            if i > 0 {
                out.push_str(", ");
            }
            out.push_str(&self.typed(*param));
        }
        out.push(')');
        if data.noinline {
            out.push_str(" noinline");
        }
        if data.is_declaration() {
            out.push('\n');
            return Ok(());
        }
        out.push_str(" {\n");
        for block in &data.blocks {
            let bd = self.block(*block);
            writeln!(out, "{}.{}:", bd.name, block.raw())?;
            for id in &bd.insts {
                if let Some(inst) = self.inst(*id) {
                    out.push_str("  ");
                    self.write_inst(out, *id, inst)?;
                    out.push('\n');
                }
            }
            if let Some(term) = &bd.terminator {
                out.push_str("  ");
                self.write_terminator(out, term)?;
                out.push('\n');
            }
        }
        out.push_str("}\n");
        Ok(())
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "; ModuleID = '{}'", self.name())?;
        for (name, ty) in self.types().named_definitions() {
            let fields: Vec<String> = self
                .types()
                .struct_fields(ty)
                .iter()
                .map(|t| self.types().display(*t))
                .collect();
            writeln!(f, "%{name} = type {{ {} }}", fields.join(", "))?;
        }
        for (_, global) in self.globals() {
            let bytes: String = global.bytes.iter().map(|b| format!("\\{b:02X}")).collect();
            writeln!(
                f,
                "@{} = private constant [{} x i8] c\"{bytes}\", align {}",
                global.name,
                global.bytes.len(),
                global.align
            )?;
        }
        for (id, _) in self.functions() {
            writeln!(f)?;
            f.write_str(&self.print_function(id))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use keel_bits::Endianness;

    use crate::types::DataLayout;
    use crate::{IrBuilder, Module};

    #[test]
    fn prints_a_small_function() {
        let mut m = Module::new(
            "print_test",
            DataLayout {
                pointer_width: 64,
                endianness: Endianness::Little,
                max_int_alignment: 8,
            },
        );
        let ptr = m.types_mut().ptr();
        let word = m.types_mut().size_int();
        let fn_ty = m.types_mut().func(&[ptr], word);
        let f = m.get_or_declare_function("load_word", fn_ty);
        let mut b = IrBuilder::new(&mut m, f);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let p = b.module().param(f, 0);
        let v = b.load(word, p, 8);
        let one = b.const_size(1);
        let sum = b.add(v, one);
        b.ret(sum);

        let text = m.to_string();
        assert!(text.contains("define i64 @load_word(ptr %arg0) {"), "{text}");
        assert!(text.contains("load i64, ptr %arg0, align 8"), "{text}");
        assert!(text.contains("= add i64"), "{text}");
        assert!(text.contains("ret i64"), "{text}");
    }
}
