//! DWARF location bridge.
//!
//! Location expressions are not evaluated here. They are compiled to Forth
//! elsewhere and run on an external stack machine; this module primes that
//! machine with the frame context, runs the code and turns the two values it
//! leaves behind into a typed [`DwarfExpressionValue`].

use std::fmt;

/// Errors raised by the external evaluator.
#[derive(Debug, thiserror::Error)]
pub enum DwarfError {
    #[error("evaluator rejected {code:?}: {reason}")]
    Evaluation { code: String, reason: String },

    #[error("evaluator prelude failed to load: {0}")]
    Prelude(String),
}

/// An interpreter that runs Forth source and collects numeric results.
pub trait StackMachine {
    fn evaluate(&mut self, code: &str) -> Result<(), DwarfError>;

    /// Remove up to `count` values from the top of the result stack, deepest
    /// first. Returns fewer values when the stack holds fewer.
    fn take_results(&mut self, count: usize) -> Vec<u32>;
}

/// What a location expression evaluated to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfExpressionValue {
    Invalid,
    MemoryAddress(u32),
    RegisterNumber(u32),
    Literal(u32),
}

impl DwarfExpressionValue {
    const TAG_MEMORY_ADDRESS: u32 = 1;
    const TAG_REGISTER_NUMBER: u32 = 2;
    const TAG_LITERAL: u32 = 3;

    /// Combine a raw value with the type tag the evaluator produced.
    pub const fn from_tagged(value: u32, tag: u32) -> Self {
        match tag {
            Self::TAG_MEMORY_ADDRESS => Self::MemoryAddress(value),
            Self::TAG_REGISTER_NUMBER => Self::RegisterNumber(value),
            Self::TAG_LITERAL => Self::Literal(value),
            _ => Self::Invalid,
        }
    }

    pub const fn value(self) -> Option<u32> {
        match self {
            Self::Invalid => None,
            Self::MemoryAddress(v) | Self::RegisterNumber(v) | Self::Literal(v) => Some(v),
        }
    }
}

impl fmt::Display for DwarfExpressionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Invalid => f.write_str("<invalid>"),
            Self::MemoryAddress(a) => write!(f, "[{a:#010x}]"),
            Self::RegisterNumber(r) => write!(f, "r{r}"),
            Self::Literal(v) => write!(f, "{v:#x}"),
        }
    }
}

pub struct DwarfEvaluator<M: StackMachine> {
    machine: M,
}

impl<M: StackMachine> DwarfEvaluator<M> {
    /// Wrap `machine`, loading the evaluator `prelude` into it first.
    pub fn new(mut machine: M, prelude: &str) -> Result<Self, DwarfError> {
        machine.evaluate(prelude).map_err(|e| DwarfError::Prelude(e.to_string()))?;
        Ok(Self { machine })
    }

    /// Evaluate `location` in the frame described by `cfa` and the optional
    /// frame base code.
    pub fn evaluate_location(
        &mut self,
        cfa: u32,
        frame_base: Option<&str>,
        location: &str,
    ) -> Result<DwarfExpressionValue, DwarfError> {
        self.machine.evaluate(&format!("init-dwarf-evaluator ${cfa:x} to cfa-value"))?;
        if let Some(frame_base) = frame_base.filter(|code| !code.is_empty()) {
            self.machine.evaluate(&format!(
                "{frame_base} to frame-base-value ' frame-base-defined >vector frame-base-rule"
            ))?;
        }
        self.machine.evaluate(&format!("{location} expression-value-type"))?;

        Ok(match self.machine.take_results(2).as_slice() {
            &[value, tag] => DwarfExpressionValue::from_tagged(value, tag),
            _ => DwarfExpressionValue::Invalid,
        })
    }

    pub fn machine(&mut self) -> &mut M {
        &mut self.machine
    }

    pub fn into_inner(self) -> M {
        self.machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records every piece of code and pushes preset results when asked.
    #[derive(Default)]
    struct ScriptedMachine {
        log: Vec<String>,
        results: Vec<u32>,
        reject: Option<&'static str>,
    }

    impl StackMachine for ScriptedMachine {
        fn evaluate(&mut self, code: &str) -> Result<(), DwarfError> {
            if self.reject.is_some_and(|word| code.contains(word)) {
                return Err(DwarfError::Evaluation { code: code.to_string(), reason: "undefined word".into() });
            }
            self.log.push(code.to_string());
            Ok(())
        }

        fn take_results(&mut self, count: usize) -> Vec<u32> {
            let at = self.results.len().saturating_sub(count);
            self.results.split_off(at)
        }
    }

    fn evaluator(results: Vec<u32>) -> DwarfEvaluator<ScriptedMachine> {
        DwarfEvaluator::new(ScriptedMachine { results, ..Default::default() }, ": prelude ;").unwrap()
    }

    #[test]
    fn test_memory_address_with_frame_base() {
        let mut dwarf = evaluator(vec![0x2000_03f0, 1]);
        let value = dwarf.evaluate_location(0x2000_0400, Some("DW_OP_call_frame_cfa"), "-16 DW_OP_fbreg").unwrap();
        assert_eq!(value, DwarfExpressionValue::MemoryAddress(0x2000_03f0));
        assert_eq!(
            dwarf.machine().log,
            vec![
                ": prelude ;".to_string(),
                "init-dwarf-evaluator $20000400 to cfa-value".to_string(),
                "DW_OP_call_frame_cfa to frame-base-value ' frame-base-defined >vector frame-base-rule".to_string(),
                "-16 DW_OP_fbreg expression-value-type".to_string(),
            ]
        );
    }

    #[test]
    fn test_tags() {
        let mut dwarf = evaluator(vec![7, 2]);
        assert_eq!(dwarf.evaluate_location(0, None, "DW_OP_reg7").unwrap(), DwarfExpressionValue::RegisterNumber(7));
        dwarf.machine().results = vec![42, 3];
        assert_eq!(dwarf.evaluate_location(0, None, "42 DW_OP_stack_value").unwrap(), DwarfExpressionValue::Literal(42));
        dwarf.machine().results = vec![42, 9];
        assert_eq!(dwarf.evaluate_location(0, None, "x").unwrap(), DwarfExpressionValue::Invalid);
        assert_eq!(dwarf.machine().log.len(), 7);
    }

    #[test]
    fn test_too_few_results_is_invalid() {
        let mut dwarf = evaluator(vec![5]);
        let value = dwarf.evaluate_location(0, Some(""), "DW_OP_nop").unwrap();
        assert_eq!(value, DwarfExpressionValue::Invalid);
        assert_eq!(value.value(), None);
    }

    #[test]
    fn test_evaluation_errors_propagate() {
        let machine = ScriptedMachine { reject: Some("bogus"), ..Default::default() };
        let mut dwarf = DwarfEvaluator::new(machine, "").unwrap();
        assert!(matches!(
            dwarf.evaluate_location(0, None, "bogus"),
            Err(DwarfError::Evaluation { .. })
        ));

        let machine = ScriptedMachine { reject: Some("prelude"), ..Default::default() };
        assert!(matches!(DwarfEvaluator::new(machine, ": prelude ;"), Err(DwarfError::Prelude(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(DwarfExpressionValue::MemoryAddress(0x2000_0000).to_string(), "[0x20000000]");
        assert_eq!(DwarfExpressionValue::RegisterNumber(13).to_string(), "r13");
    }
}
