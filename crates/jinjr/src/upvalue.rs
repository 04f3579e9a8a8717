//! Chained name→value tables for environment and render-scoped variables.
//!
//! Each table maps a name to a *stack* of nodes, and tables chain through a
//! parent link. Lookup walks from the newest table toward the root, stopping
//! at a caller-specified boundary. The per-name stack exists so a batch of
//! bindings (an include's environment, an `{% upvalue %}` body) can be
//! pushed and torn down as a unit without disturbing outer bindings of the
//! same name.

use std::collections::HashMap;
use std::rc::Rc;

use crate::heap::ObjRef;
use crate::object::{ClassDef, HostFn};
use crate::value::Value;

/// What a binding holds.
#[derive(Clone)]
pub enum UpvalueSlot {
    Value(Value),
    /// Host-registered function, filter or test.
    HostFn(HostFn),
    /// User-registered class constructor.
    ClassCtor(Rc<ClassDef>),
    /// Reference to a template function (bound by `from ... import` and by
    /// `__caller__`).
    Macro { template: ObjRef, name: Rc<str> },
}

impl std::fmt::Debug for UpvalueSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpvalueSlot::Value(v) => write!(f, "Value({v:?})"),
            UpvalueSlot::HostFn(_) => write!(f, "HostFn"),
            UpvalueSlot::ClassCtor(c) => write!(f, "ClassCtor({})", c.name),
            UpvalueSlot::Macro { name, .. } => write!(f, "Macro({name})"),
        }
    }
}

/// One node on a per-name stack.
#[derive(Debug, Clone)]
pub struct Upvalue {
    pub slot: UpvalueSlot,
    /// A fixed node rejects subsequent non-forced adds of the same name
    /// (the include directive's `fix` option).
    pub fixed: bool,
}

/// Identifier of a table in a [`UpvalueChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableId(usize);

struct Table {
    entries: HashMap<String, Vec<Upvalue>>,
    parent: Option<TableId>,
}

/// A chain of upvalue tables. The engine owns one root table for host
/// registrations; renders push child tables for include environments and
/// tear them down wholesale. Popped tables are recycled.
pub struct UpvalueChain {
    tables: Vec<Table>,
    free: Vec<usize>,
    head: TableId,
}

impl UpvalueChain {
    pub fn new() -> Self {
        Self {
            tables: vec![Table {
                entries: HashMap::new(),
                parent: None,
            }],
            free: Vec::new(),
            head: TableId(0),
        }
    }

    pub fn root(&self) -> TableId {
        TableId(0)
    }

    /// Push a new table on the chain and make it the head.
    pub fn push_table(&mut self) -> TableId {
        let parent = Some(self.head);
        self.head = match self.free.pop() {
            Some(idx) => {
                self.tables[idx].parent = parent;
                TableId(idx)
            }
            None => {
                self.tables.push(Table {
                    entries: HashMap::new(),
                    parent,
                });
                TableId(self.tables.len() - 1)
            }
        };
        self.head
    }

    /// Drop the head table (with everything it holds) and restore its parent.
    pub fn pop_table(&mut self) {
        let parent = self.tables[self.head.0]
            .parent
            .expect("cannot pop the root upvalue table");
        self.tables[self.head.0].entries.clear();
        self.free.push(self.head.0);
        self.head = parent;
    }

    /// Add a binding on top of `name`'s stack in the head table.
    ///
    /// Fails when the visible binding is fixed and `force` is not set.
    pub fn add(&mut self, name: &str, value: Upvalue, force: bool) -> bool {
        if !force
            && let Some(existing) = self.find(name, None)
            && existing.fixed
        {
            return false;
        }
        self.tables[self.head.0]
            .entries
            .entry(name.to_string())
            .or_default()
            .push(value);
        true
    }

    /// Overwrite the visible binding of `name` in the table that defines it,
    /// or create it in the head table.
    pub fn set(&mut self, name: &str, slot: UpvalueSlot) {
        let mut cur = Some(self.head);
        while let Some(id) = cur {
            if let Some(stack) = self.tables[id.0].entries.get_mut(name)
                && let Some(top) = stack.last_mut()
            {
                top.slot = slot;
                return;
            }
            cur = self.tables[id.0].parent;
        }
        self.add(name, Upvalue { slot, fixed: false }, true);
    }

    /// Pop the top binding of `name`, searching the chain head-first.
    /// Returns whether a binding was removed.
    pub fn del(&mut self, name: &str) -> bool {
        let mut cur = Some(self.head);
        while let Some(id) = cur {
            if let Some(stack) = self.tables[id.0].entries.get_mut(name)
                && !stack.is_empty()
            {
                stack.pop();
                if stack.is_empty() {
                    self.tables[id.0].entries.remove(name);
                }
                return true;
            }
            cur = self.tables[id.0].parent;
        }
        false
    }

    /// Find the visible binding of `name`, walking the chain from the head
    /// to `stop` (exclusive; `None` walks the whole chain).
    pub fn find(&self, name: &str, stop: Option<TableId>) -> Option<&Upvalue> {
        let mut cur = Some(self.head);
        while let Some(id) = cur {
            if Some(id) == stop {
                break;
            }
            if let Some(stack) = self.tables[id.0].entries.get(name)
                && let Some(top) = stack.last()
            {
                return Some(top);
            }
            cur = self.tables[id.0].parent;
        }
        None
    }

    /// Clear every binding of the head table without popping it.
    pub fn clear_head(&mut self) {
        self.tables[self.head.0].entries.clear();
    }
}

impl Default for UpvalueChain {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn val(n: f64) -> Upvalue {
        Upvalue {
            slot: UpvalueSlot::Value(Value::Number(n)),
            fixed: false,
        }
    }

    fn get_num(chain: &UpvalueChain, name: &str) -> Option<f64> {
        match chain.find(name, None)?.slot {
            UpvalueSlot::Value(Value::Number(n)) => Some(n),
            _ => None,
        }
    }

    #[test]
    fn per_name_stacks_shadow_and_restore() {
        let mut chain = UpvalueChain::new();
        assert!(chain.add("x", val(1.0), false));
        assert!(chain.add("x", val(2.0), false));
        assert_eq!(get_num(&chain, "x"), Some(2.0));
        assert!(chain.del("x"));
        assert_eq!(get_num(&chain, "x"), Some(1.0));
        assert!(chain.del("x"));
        assert_eq!(get_num(&chain, "x"), None);
        assert!(!chain.del("x"));
    }

    #[test]
    fn child_tables_shadow_and_pop_in_bulk() {
        let mut chain = UpvalueChain::new();
        chain.add("a", val(1.0), false);
        chain.push_table();
        chain.add("a", val(10.0), false);
        chain.add("b", val(20.0), false);
        assert_eq!(get_num(&chain, "a"), Some(10.0));
        assert_eq!(get_num(&chain, "b"), Some(20.0));
        chain.pop_table();
        assert_eq!(get_num(&chain, "a"), Some(1.0));
        assert_eq!(get_num(&chain, "b"), None);
    }

    #[test]
    fn fixed_bindings_reject_unforced_adds() {
        let mut chain = UpvalueChain::new();
        chain.add(
            "locked",
            Upvalue {
                slot: UpvalueSlot::Value(Value::Number(1.0)),
                fixed: true,
            },
            false,
        );
        assert!(!chain.add("locked", val(2.0), false));
        assert!(chain.add("locked", val(3.0), true));
        assert_eq!(get_num(&chain, "locked"), Some(3.0));
    }

    #[test]
    fn lookup_stops_at_the_boundary() {
        let mut chain = UpvalueChain::new();
        let root = chain.root();
        chain.add("only_in_root", val(1.0), false);
        chain.push_table();
        assert!(chain.find("only_in_root", None).is_some());
        assert!(chain.find("only_in_root", Some(root)).is_none());
        chain.pop_table();
    }
}
