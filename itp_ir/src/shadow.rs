//! Shadow arrays
//!
//! Building a subsumption-table entry lifts the free arrays of an interpolant
//! into existentially quantified variables. The lifting renames each array to
//! a *shadow* copy; this module owns the array cache that issues fresh arrays
//! and the registry that remembers the source ↔ shadow pairing.
//!
//! Shadowing an expression is a pure homomorphism over expression kinds: every
//! `Read` is rewritten to read from the shadow of its source array (update
//! lists rebuilt recursively with both index and value shadowed), constants
//! are untouched, and every shadow array encountered is appended once to the
//! caller's replacement list.

use crate::expr::{Array, ArrayRef, Expr, ExprRef, UpdateList};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

/// Issues uniquely-identified arrays, interning by name and size.
#[derive(Debug, Default)]
pub struct ArrayCache {
    next_id: Cell<u64>,
    interned: RefCell<HashMap<(String, u64), ArrayRef>>,
}

impl ArrayCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or fetch the interned copy of) a byte array.
    #[must_use]
    pub fn create(&self, name: &str, size: u64) -> ArrayRef {
        let key = (name.to_string(), size);
        if let Some(existing) = self.interned.borrow().get(&key) {
            return Rc::clone(existing);
        }
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        let array = Rc::new(Array {
            id,
            name: name.to_string(),
            size,
            domain_width: 32,
            range_width: 8,
        });
        self.interned
            .borrow_mut()
            .insert(key, Rc::clone(&array));
        array
    }
}

/// Source → shadow array map shared by entry construction and the WP pass.
#[derive(Debug)]
pub struct ShadowRegistry {
    cache: Rc<ArrayCache>,
    /// source array id → shadow array
    shadows: RefCell<HashMap<u64, ArrayRef>>,
    /// source array *name* → shadow array, for WP symbol lookup
    by_source_name: RefCell<HashMap<String, ArrayRef>>,
}

impl ShadowRegistry {
    #[must_use]
    pub fn new(cache: Rc<ArrayCache>) -> Self {
        Self {
            cache,
            shadows: RefCell::new(HashMap::new()),
            by_source_name: RefCell::new(HashMap::new()),
        }
    }

    /// The shadow copy of `source`, created on first use.
    #[must_use]
    pub fn shadow_of(&self, source: &ArrayRef) -> ArrayRef {
        if let Some(existing) = self.shadows.borrow().get(&source.id) {
            return Rc::clone(existing);
        }
        let shadow = self
            .cache
            .create(&format!("{}__shadow", source.name), source.size);
        self.shadows
            .borrow_mut()
            .insert(source.id, Rc::clone(&shadow));
        self.by_source_name
            .borrow_mut()
            .insert(source.name.clone(), Rc::clone(&shadow));
        shadow
    }

    /// The shadow array previously created for a source array of this name.
    #[must_use]
    pub fn shadow_for_name(&self, source_name: &str) -> Option<ArrayRef> {
        self.by_source_name.borrow().get(source_name).cloned()
    }

    /// Whether `array` is a shadow issued by this registry.
    #[must_use]
    pub fn is_shadow(&self, array: &ArrayRef) -> bool {
        self.shadows
            .borrow()
            .values()
            .any(|s| s.id == array.id)
    }

    fn shadow_updates(&self, updates: &UpdateList, replacements: &mut Vec<ArrayRef>) -> UpdateList {
        let root = self.shadow_of(&updates.root);
        if !replacements.contains(&root) {
            replacements.push(Rc::clone(&root));
        }
        let writes = updates
            .writes
            .iter()
            .map(|(i, v)| {
                (
                    self.shadow_expr(i, replacements),
                    self.shadow_expr(v, replacements),
                )
            })
            .collect();
        UpdateList::with_writes(root, writes)
    }

    /// Rewrite `expr` so every read goes through a shadow array.
    ///
    /// Identity on constants. Each shadow array encountered is appended to
    /// `replacements`, duplicates skipped.
    #[must_use]
    pub fn shadow_expr(&self, expr: &ExprRef, replacements: &mut Vec<ArrayRef>) -> ExprRef {
        match expr.as_ref() {
            Expr::Const { .. } => Rc::clone(expr),
            Expr::Read { updates, index } => Expr::read(
                self.shadow_updates(updates, replacements),
                self.shadow_expr(index, replacements),
            ),
            Expr::Concat { msb, lsb } => Expr::concat(
                self.shadow_expr(msb, replacements),
                self.shadow_expr(lsb, replacements),
            ),
            Expr::Extract {
                expr: inner,
                offset,
                width,
            } => Expr::extract(self.shadow_expr(inner, replacements), *offset, *width),
            Expr::ZExt { expr: inner, width } => {
                Expr::zext(self.shadow_expr(inner, replacements), *width)
            }
            Expr::SExt { expr: inner, width } => {
                Expr::sext(self.shadow_expr(inner, replacements), *width)
            }
            Expr::Select {
                cond,
                true_expr,
                false_expr,
            } => Expr::select(
                self.shadow_expr(cond, replacements),
                self.shadow_expr(true_expr, replacements),
                self.shadow_expr(false_expr, replacements),
            ),
            Expr::Not(inner) => Expr::not(self.shadow_expr(inner, replacements)),
            Expr::Binary { op, left, right } => Expr::binary(
                *op,
                self.shadow_expr(left, replacements),
                self.shadow_expr(right, replacements),
            ),
            Expr::Cmp { op, left, right } => Expr::cmp(
                *op,
                self.shadow_expr(left, replacements),
                self.shadow_expr(right, replacements),
            ),
            Expr::Exists { arrays, body } => {
                Expr::exists(arrays.clone(), self.shadow_expr(body, replacements))
            }
        }
    }
}
