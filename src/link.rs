//! Placeholder-and-patch linker.
//!
//! Functions compile in any order; a direct call to a not-yet-compiled
//! callee targets a placeholder code object carrying the callee's index.
//! After every body is compiled, [`Linker::link`] walks each finished
//! code's call-site fixups and rewrites placeholder targets to the real
//! code. A second pass is a fixed point and patches nothing.

use log::debug;

use crate::backend::{handle, Code, CodeHandle};

pub struct Linker {
    placeholders: Vec<Option<CodeHandle>>,
    finished: Vec<Option<CodeHandle>>,
}

impl Linker {
    pub fn new(function_count: usize) -> Self {
        Self {
            placeholders: vec![None; function_count],
            finished: vec![None; function_count],
        }
    }

    /// The code handle for function `index`: the finished code if compiled,
    /// otherwise the (possibly freshly allocated) placeholder. Out-of-range
    /// indices are a programming error.
    pub fn get_function_code(&mut self, index: u16) -> CodeHandle {
        let i = index as usize;
        if let Some(h) = &self.finished[i] {
            return h.clone();
        }
        if let Some(h) = &self.placeholders[i] {
            return h.clone();
        }
        let h = handle(Code::Placeholder { index });
        self.placeholders[i] = Some(h.clone());
        h
    }

    /// Install the compiled code for function `index`.
    pub fn finish(&mut self, index: u16, code: Code) -> CodeHandle {
        let h = handle(code);
        self.finished[index as usize] = Some(h.clone());
        h
    }

    pub fn finished_code(&self, index: u16) -> Option<CodeHandle> {
        self.finished[index as usize].clone()
    }

    /// Patch every direct-call fixup that still targets a placeholder.
    /// Returns the number of rewritten call sites.
    pub fn link(&mut self) -> usize {
        let mut patches = 0;
        for i in 0..self.finished.len() {
            let Some(h) = self.finished[i].clone() else { continue };
            let mut code = h.borrow_mut();
            let Code::Evaluated(ec) = &mut *code else { continue };
            for target in &mut ec.calls {
                // try_borrow: a self-call fixup already points at the code
                // being walked, which is never a placeholder.
                let placeholder = target
                    .handle
                    .try_borrow()
                    .ok()
                    .and_then(|c| c.placeholder_index());
                if let Some(j) = placeholder {
                    let replacement = self.finished[j as usize]
                        .clone()
                        .expect("placeholder target was never compiled");
                    target.handle = replacement;
                    ec.patched = true;
                    patches += 1;
                }
            }
        }
        debug!("link pass patched {patches} call sites");
        patches
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_allocated_once() {
        let mut linker = Linker::new(2);
        let a = linker.get_function_code(1);
        let b = linker.get_function_code(1);
        assert!(std::rc::Rc::ptr_eq(&a, &b));
        assert_eq!(a.borrow().placeholder_index(), Some(1));
    }

    #[test]
    fn finished_code_wins_over_placeholder() {
        let mut linker = Linker::new(1);
        let ph = linker.get_function_code(0);
        let real = linker.finish(0, Code::Placeholder { index: 99 }); // any code object
        let got = linker.get_function_code(0);
        assert!(std::rc::Rc::ptr_eq(&got, &real));
        assert!(!std::rc::Rc::ptr_eq(&got, &ph));
    }
}
