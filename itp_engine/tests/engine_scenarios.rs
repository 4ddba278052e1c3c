//! End-to-end scenarios driving the engine the way the interpreter does:
//! instruction events, branch constraints, path-condition marking, node
//! removal, and solver-backed subsumption checks.

use itp_engine::instr::{
    Instruction, InstrRef, IntPredicate, Opcode, TargetData, TypeDesc, ValueDesc, ValueDescRef,
    ValueId, ValueKind,
};
use itp_engine::Engine;
use itp_ir::expr::{CmpOp, Expr, ExprRef, UpdateList};
use itp_ir::{InterpConfig, Query, SolverBackend, Validity};
use std::rc::Rc;
use std::time::Duration;

// ===== Helpers =====

fn int_ty(bits: u32) -> TypeDesc {
    TypeDesc::Int { bits }
}

fn ptr_ty(bits: u32) -> TypeDesc {
    TypeDesc::Pointer {
        elem: Box::new(int_ty(bits)),
    }
}

fn instr_value(id: u64, name: &str, ty: TypeDesc) -> ValueDescRef {
    Rc::new(ValueDesc {
        id: ValueId(id),
        name: name.to_string(),
        kind: ValueKind::Instruction,
        ty,
    })
}

fn const_value(id: u64, value: u64, bits: u32) -> ValueDescRef {
    Rc::new(ValueDesc {
        id: ValueId(id),
        name: value.to_string(),
        kind: ValueKind::ConstantInt { value },
        ty: int_ty(bits),
    })
}

fn void_result(id: u64) -> ValueDescRef {
    instr_value(id, "", TypeDesc::Void)
}

fn alloca(id: u64, name: &str, size: u64, elem_bits: u32) -> InstrRef {
    Instruction::new(
        id,
        Opcode::Alloca { size },
        instr_value(id, name, ptr_ty(elem_bits)),
        vec![],
        "main",
    )
}

fn store(id: u64, value: ValueDescRef, address: ValueDescRef) -> InstrRef {
    Instruction::new(id, Opcode::Store, void_result(id), vec![value, address], "main")
}

fn load(id: u64, name: &str, bits: u32, address: ValueDescRef) -> InstrRef {
    Instruction::new(
        id,
        Opcode::Load,
        instr_value(id, name, int_ty(bits)),
        vec![address],
        "main",
    )
}

fn engine() -> Engine {
    Engine::new(InterpConfig::default(), TargetData::default())
}

fn symbolic(cache: &itp_ir::ArrayCache, name: &str, index: u64) -> ExprRef {
    Expr::read(
        UpdateList::new(cache.create(name, 4)),
        Expr::constant(index, 32),
    )
}

/// A solver scripted with a fixed answer and unsat core.
struct ScriptedSolver {
    validity: Validity,
    core: Vec<ExprRef>,
    calls: usize,
}

impl ScriptedSolver {
    fn valid(core: Vec<ExprRef>) -> Self {
        Self {
            validity: Validity::Valid,
            core,
            calls: 0,
        }
    }

    fn unknown() -> Self {
        Self {
            validity: Validity::Unknown,
            core: vec![],
            calls: 0,
        }
    }
}

impl SolverBackend for ScriptedSolver {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn compute_validity(&mut self, _query: &Query, _timeout: Duration) -> Validity {
        self.calls += 1;
        self.validity
    }

    fn unsat_core(&self) -> Vec<ExprRef> {
        self.core.clone()
    }
}

const TIMEOUT: Duration = Duration::from_millis(100);

// ===== S1: alloca + store + load =====

#[test]
fn alloca_store_load_propagates_value() {
    let mut engine = engine();
    let a = alloca(1, "a", 4, 32);
    let a_value = &a.result;

    engine
        .execute(&a, &vec![], &[Expr::constant(0x1000, 64)], false)
        .expect("alloca")
        .expect("alloca result");

    let st = store(2, const_value(100, 7, 32), Rc::clone(a_value));
    engine
        .execute(
            &st,
            &vec![],
            &[Expr::constant(7, 32), Expr::constant(0x1000, 64)],
            false,
        )
        .expect("store");

    let ld = load(3, "v", 32, Rc::clone(a_value));
    let loaded = engine
        .execute(
            &ld,
            &vec![],
            &[Expr::constant(7, 32), Expr::constant(0x1000, 64)],
            false,
        )
        .expect("load")
        .expect("load result");

    // The loaded value is the stored constant.
    assert_eq!(loaded.expr().as_const(), Some((7, 32)));

    // The store relates a's location to address value a and the stored 7.
    let dependency = engine.current().borrow().dependency();
    let pointer = dependency
        .latest_value_no_constant_check(ValueId(1))
        .expect("a's versioned value");
    let locations = pointer.locations();
    assert_eq!(locations.len(), 1);
    let (address_value, stored_value) = dependency
        .read_store(&locations[0])
        .expect("frame lookup")
        .expect("stored pair");
    assert_eq!(address_value.value_id(), ValueId(1));
    assert_eq!(stored_value.expr().as_const(), Some((7, 32)));
}

#[test]
fn second_store_overwrites_first() {
    let mut engine = engine();
    let a = alloca(1, "a", 4, 32);
    engine
        .execute(&a, &vec![], &[Expr::constant(0x1000, 64)], false)
        .expect("alloca");

    for (id, v) in [(2u64, 7u64), (3, 9)] {
        let st = store(id, const_value(100 + id, v, 32), Rc::clone(&a.result));
        engine
            .execute(
                &st,
                &vec![],
                &[Expr::constant(v, 32), Expr::constant(0x1000, 64)],
                false,
            )
            .expect("store");
    }

    let dependency = engine.current().borrow().dependency();
    let pointer = dependency
        .latest_value_no_constant_check(ValueId(1))
        .expect("a");
    let (_, stored) = dependency
        .read_store(&pointer.locations()[0])
        .expect("frame")
        .expect("pair");
    // At most one latest value per location: the second store wins.
    assert_eq!(stored.expr().as_const(), Some((9, 32)));
}

// ===== S2: single-branch subsumption =====

/// Explore `if (x == 0) { ... }`, table the then-block entry with
/// interpolant `x = 0`, then reach the same block with `x = 0 ∧ y > 3` and
/// check the earlier entry subsumes it.
#[test]
fn single_branch_subsumption() {
    let mut engine = engine();
    let cache = Rc::clone(engine.arrays());
    let x_eq_0 = Expr::cmp(CmpOp::Eq, symbolic(&cache, "x", 0), Expr::constant(0, 8));
    let y_gt_3 = Expr::cmp(CmpOp::Ugt, symbolic(&cache, "y", 0), Expr::constant(3, 8));

    // First exploration: root splits at the branch; the then-child gets the
    // constraint and the then-block program point.
    let root = engine.root();
    let (then_node, else_node) = engine.split(&root);
    engine.set_current_node(&then_node, 100);
    engine.add_constraint(Rc::clone(&x_eq_0), ValueId(50));

    // The suffix below proved infeasible with x = 0 in the unsat core.
    engine.mark_path_condition(&[Rc::clone(&x_eq_0)], None);
    engine.remove(&then_node);
    assert_eq!(engine.subsumption_table().len(), 1);
    let entry = &engine.subsumption_table().entries_at(100)[0];
    let interpolant = entry.interpolant().expect("marked constraint");
    assert!(interpolant.to_string().contains("x__shadow"));

    // Second exploration reaches the same block along another path.
    engine.set_current_node(&else_node, 7);
    let (reach, _other) = engine.split(&else_node);
    engine.set_current_node(&reach, 100);
    engine.add_constraint(Rc::clone(&x_eq_0), ValueId(50));
    engine.add_constraint(Rc::clone(&y_gt_3), ValueId(51));

    let constraints = vec![Rc::clone(&x_eq_0), Rc::clone(&y_gt_3)];
    let mut solver = ScriptedSolver::valid(vec![Rc::clone(&x_eq_0)]);
    assert!(engine.check_current_state_subsumption(&mut solver, &constraints, TIMEOUT));
    assert_eq!(solver.calls, 1);
    assert!(engine.current().borrow().is_subsumed());

    // A subsumed node leaves no table entry behind.
    engine.remove(&reach);
    assert_eq!(engine.subsumption_table().entries_at(100).len(), 1);
}

#[test]
fn subsumption_fails_at_other_program_point() {
    let mut engine = engine();
    let cache = Rc::clone(engine.arrays());
    let x_eq_0 = Expr::cmp(CmpOp::Eq, symbolic(&cache, "x", 0), Expr::constant(0, 8));

    let root = engine.root();
    let (a, b) = engine.split(&root);
    engine.set_current_node(&a, 100);
    engine.add_constraint(Rc::clone(&x_eq_0), ValueId(50));
    engine.mark_path_condition(&[Rc::clone(&x_eq_0)], None);
    engine.remove(&a);

    // Same constraints, different program point: the guard fails before any
    // solver call.
    engine.set_current_node(&b, 200);
    engine.add_constraint(Rc::clone(&x_eq_0), ValueId(50));
    let mut solver = ScriptedSolver::valid(vec![]);
    let constraints = vec![x_eq_0];
    assert!(!engine.check_current_state_subsumption(&mut solver, &constraints, TIMEOUT));
    assert_eq!(solver.calls, 0);
}

#[test]
fn solver_unknown_fails_safely() {
    let mut engine = engine();
    let cache = Rc::clone(engine.arrays());
    let x_eq_0 = Expr::cmp(CmpOp::Eq, symbolic(&cache, "x", 0), Expr::constant(0, 8));
    let x_eq_1 = Expr::cmp(CmpOp::Eq, symbolic(&cache, "x", 0), Expr::constant(1, 8));

    let root = engine.root();
    let (a, b) = engine.split(&root);
    engine.set_current_node(&a, 100);
    engine.add_constraint(Rc::clone(&x_eq_0), ValueId(50));
    engine.mark_path_condition(&[Rc::clone(&x_eq_0)], None);
    engine.remove(&a);

    engine.set_current_node(&b, 100);
    engine.add_constraint(Rc::clone(&x_eq_1), ValueId(50));
    let mut solver = ScriptedSolver::unknown();
    let constraints = vec![x_eq_1];
    assert!(!engine.check_current_state_subsumption(&mut solver, &constraints, TIMEOUT));
    assert!(!engine.current().borrow().is_subsumed());
    assert_eq!(engine.stats_report().solver_failures, 1);
}

// ===== S3: bound slackening =====

#[test]
fn bounds_check_records_slackened_bound() {
    let mut engine = engine();
    let a = alloca(1, "a", 8, 8);
    engine
        .execute(&a, &vec![], &[Expr::constant(0x2000, 64)], false)
        .expect("alloca");

    // A load through a, with the interpreter's bounds check passed.
    let ld = load(2, "v", 8, Rc::clone(&a.result));
    engine
        .execute_memory_operation(
            &ld,
            &vec![],
            &[Expr::constant(0, 8), Expr::constant(0x2000, 64)],
            true,
            false,
        )
        .expect("load");

    let dependency = engine.current().borrow().dependency();
    let pointer = dependency
        .latest_value_no_constant_check(ValueId(1))
        .expect("a");
    // Slackening recorded the allocation size as the proven bound.
    let loc = &pointer.locations()[0];
    assert!(loc.bounds().contains(&Expr::constant(8, 64)));
    // And the pointer's flow is core.
    assert!(pointer.is_core());
}

#[test]
fn bound_disabled_by_config() {
    let config = InterpConfig {
        no_bound_interpolation: true,
        ..Default::default()
    };
    let mut engine = Engine::new(config, TargetData::default());
    let a = alloca(1, "a", 8, 8);
    engine
        .execute(&a, &vec![], &[Expr::constant(0x2000, 64)], false)
        .expect("alloca");
    let ld = load(2, "v", 8, Rc::clone(&a.result));
    engine
        .execute_memory_operation(
            &ld,
            &vec![],
            &[Expr::constant(0, 8), Expr::constant(0x2000, 64)],
            true,
            false,
        )
        .expect("load");

    let dependency = engine.current().borrow().dependency();
    let pointer = dependency
        .latest_value_no_constant_check(ValueId(1))
        .expect("a");
    assert!(pointer.locations()[0].bounds().is_empty());
}

// ===== S4: shadow existential =====

#[test]
fn entry_shadows_interpolant_and_collects_existentials() {
    let mut engine = engine();
    let cache = Rc::clone(engine.arrays());
    let read_a = symbolic(&cache, "A", 0);
    let constraint = Expr::cmp(CmpOp::Eq, read_a, Expr::constant(5, 8));

    let root = engine.root();
    let (n, _) = engine.split(&root);
    engine.set_current_node(&n, 10);
    engine.add_constraint(Rc::clone(&constraint), ValueId(60));
    engine.mark_path_condition(&[Rc::clone(&constraint)], None);
    engine.remove(&n);

    let entry = &engine.subsumption_table().entries_at(10)[0];
    let interpolant = entry.interpolant().expect("interpolant");
    assert_eq!(interpolant.to_string(), "(A__shadow[0] = 5)");
    assert_eq!(entry.existentials().len(), 1);
    assert_eq!(entry.existentials()[0].name, "A__shadow");
}

#[test]
fn no_existential_flag_skips_shadowing() {
    let config = InterpConfig {
        no_existential: true,
        ..Default::default()
    };
    let mut engine = Engine::new(config, TargetData::default());
    let cache = Rc::clone(engine.arrays());
    let constraint = Expr::cmp(CmpOp::Eq, symbolic(&cache, "A", 0), Expr::constant(5, 8));

    let root = engine.root();
    let (n, _) = engine.split(&root);
    engine.set_current_node(&n, 10);
    engine.add_constraint(Rc::clone(&constraint), ValueId(60));
    engine.mark_path_condition(&[constraint], None);
    engine.remove(&n);

    // The interpolant itself is still shadowed (it drives the existential
    // query), but store snapshots skip shadowing under the flag; with no
    // memory written the entry simply records the interpolant.
    let entry = &engine.subsumption_table().entries_at(10)[0];
    assert!(entry.interpolant().is_some());
}

// ===== S6: copy-on-write across split =====

#[test]
fn child_store_update_does_not_leak_into_sibling() {
    let mut engine = engine();
    let a = alloca(1, "a", 4, 32);
    engine
        .execute(&a, &vec![], &[Expr::constant(0x1000, 64)], false)
        .expect("alloca");
    let st = store(2, const_value(100, 7, 32), Rc::clone(&a.result));
    engine
        .execute(
            &st,
            &vec![],
            &[Expr::constant(7, 32), Expr::constant(0x1000, 64)],
            false,
        )
        .expect("store");

    let root = engine.root();
    let (left, right) = engine.split(&root);

    // Write 9 in the left child only.
    engine.set_current_node(&left, 20);
    let st2 = store(3, const_value(101, 9, 32), Rc::clone(&a.result));
    engine
        .execute(
            &st2,
            &vec![],
            &[Expr::constant(9, 32), Expr::constant(0x1000, 64)],
            false,
        )
        .expect("store in child");

    let left_dep = left.borrow().dependency();
    let right_dep = right.borrow().dependency();
    let pointer = left_dep
        .latest_value_no_constant_check(ValueId(1))
        .expect("a");
    let loc = &pointer.locations()[0];

    let (_, left_val) = left_dep.read_store(loc).expect("frame").expect("pair");
    assert_eq!(left_val.expr().as_const(), Some((9, 32)));

    let (_, right_val) = right_dep.read_store(loc).expect("frame").expect("pair");
    assert_eq!(right_val.expr().as_const(), Some((7, 32)));
}

// ===== Core monotonicity =====

#[test]
fn core_marking_is_transitive_over_flow() {
    let mut engine = engine();
    let cache = Rc::clone(engine.arrays());
    let sym_a = Expr::zext(symbolic(&cache, "a", 0), 32);
    let sym_b = Expr::zext(symbolic(&cache, "b", 0), 32);

    // za = zext a; zb = zext b; c = za + zb. Arguments materialize on
    // demand; marking c's flow must reach both of them.
    let a_arg = Rc::new(ValueDesc {
        id: ValueId(1),
        name: "a".to_string(),
        kind: ValueKind::Argument { of_main: false },
        ty: int_ty(32),
    });
    let b_arg = Rc::new(ValueDesc {
        id: ValueId(2),
        name: "b".to_string(),
        kind: ValueKind::Argument { of_main: false },
        ty: int_ty(32),
    });

    let zext_a = Instruction::new(
        3,
        Opcode::ZExt,
        instr_value(3, "za", int_ty(64)),
        vec![a_arg],
        "f",
    );
    let zext_b = Instruction::new(
        4,
        Opcode::ZExt,
        instr_value(4, "zb", int_ty(64)),
        vec![b_arg],
        "f",
    );
    let za_expr = Expr::zext(Rc::clone(&sym_a), 64);
    let zb_expr = Expr::zext(Rc::clone(&sym_b), 64);
    engine
        .execute(&zext_a, &vec![], &[Rc::clone(&za_expr)], false)
        .expect("zext a");
    engine
        .execute(&zext_b, &vec![], &[Rc::clone(&zb_expr)], false)
        .expect("zext b");

    let add = Instruction::new(
        5,
        Opcode::Add,
        instr_value(5, "c", int_ty(64)),
        vec![Rc::clone(&zext_a.result), Rc::clone(&zext_b.result)],
        "f",
    );
    let sum = Expr::binary(itp_ir::BinOp::Add, Rc::clone(&za_expr), Rc::clone(&zb_expr));
    engine
        .execute(&add, &vec![], &[sum, za_expr, zb_expr], false)
        .expect("add");

    let dependency = engine.current().borrow().dependency();
    let c = dependency
        .latest_value_no_constant_check(ValueId(5))
        .expect("c");
    let mut graph = itp_engine::alloc_graph::AllocationGraph::new();
    dependency.mark_all_values(&mut graph, &c, "test");

    for id in [1u64, 2, 3, 4, 5] {
        let v = dependency
            .latest_value_no_constant_check(ValueId(id))
            .expect("value");
        assert!(v.is_core(), "value {id} must be core");
    }
}

// ===== Empty entry subsumes =====

#[test]
fn empty_entry_subsumes_everything_at_its_point() {
    let mut engine = engine();
    let root = engine.root();
    let (a, b) = engine.split(&root);

    // Remove an unmarked node: its entry has no interpolant, no stores.
    engine.set_current_node(&a, 100);
    engine.remove(&a);
    assert!(engine.subsumption_table().entries_at(100)[0].is_empty());

    engine.set_current_node(&b, 100);
    let mut solver = ScriptedSolver::unknown();
    assert!(engine.check_current_state_subsumption(&mut solver, &[], TIMEOUT));
    // Decided without the solver.
    assert_eq!(solver.calls, 0);
}

// ===== Call binding =====

#[test]
fn call_arguments_bind_to_parameters_and_return_flows_back() {
    let mut engine = engine();
    let cache = Rc::clone(engine.arrays());
    let arg_expr = Expr::zext(symbolic(&cache, "n", 0), 32);

    // %za materializes the argument value the call will pass on.
    let n_arg = Rc::new(ValueDesc {
        id: ValueId(1),
        name: "n".to_string(),
        kind: ValueKind::Argument { of_main: false },
        ty: int_ty(32),
    });
    let zext = Instruction::new(
        2,
        Opcode::ZExt,
        instr_value(2, "zn", int_ty(32)),
        vec![n_arg],
        "main",
    );
    engine
        .execute(&zext, &vec![], &[Rc::clone(&arg_expr)], false)
        .expect("zext");

    // call @f(%zn)
    let site = Instruction::new(
        3,
        Opcode::Call {
            callee: Some("f".to_string()),
        },
        instr_value(3, "r", int_ty(32)),
        vec![Rc::clone(&zext.result)],
        "main",
    );
    let param = Rc::new(ValueDesc {
        id: ValueId(10),
        name: "p".to_string(),
        kind: ValueKind::Argument { of_main: false },
        ty: int_ty(32),
    });
    engine.bind_call_arguments(&site, &vec![], &[Rc::clone(&arg_expr)], &[Rc::clone(&param)]);

    let dependency = engine.current().borrow().dependency();
    let bound = dependency
        .latest_value_no_constant_check(ValueId(10))
        .expect("parameter bound");
    assert_eq!(bound.expr(), arg_expr);
    // The parameter flows from the argument value.
    assert_eq!(bound.sources().len(), 1);

    // ret %p
    let ret = Instruction::new(
        4,
        Opcode::Ret { has_value: true },
        void_result(4),
        vec![param],
        "f",
    );
    engine.bind_return_value(&site, &vec![3], &ret, Some(&arg_expr));

    let callsite_value = dependency
        .latest_value_no_constant_check(ValueId(3))
        .expect("callsite value");
    assert_eq!(callsite_value.expr(), arg_expr);
    assert_eq!(callsite_value.sources().len(), 1);
}

#[test]
fn unknown_external_leaves_result_unlinked() {
    let mut engine = engine();
    let site = Instruction::new(
        1,
        Opcode::Call {
            callee: Some("mystery_fn".to_string()),
        },
        instr_value(1, "r", int_ty(32)),
        vec![const_value(100, 1, 32)],
        "main",
    );
    let result = engine
        .execute(
            &site,
            &vec![],
            &[Expr::constant(0, 32), Expr::constant(1, 32)],
            false,
        )
        .expect("call")
        .expect("result value");
    assert!(result.sources().is_empty());
}

#[test]
fn malloc_allocates_with_size() {
    let mut engine = engine();
    let site = Instruction::new(
        1,
        Opcode::Call {
            callee: Some("malloc".to_string()),
        },
        instr_value(1, "p", ptr_ty(8)),
        vec![const_value(100, 16, 64)],
        "main",
    );
    let result = engine
        .execute(
            &site,
            &vec![],
            &[Expr::constant(0x3000, 64), Expr::constant(16, 64)],
            false,
        )
        .expect("call")
        .expect("pointer");
    let locations = result.locations();
    assert_eq!(locations.len(), 1);
    assert_eq!(locations[0].size, 16);
}

// ===== S5 follow-on: WP interpolant folded into the entry =====

#[test]
fn wp_interpolant_lands_on_table_entry() {
    let config = InterpConfig {
        wp_interpolant: true,
        ..Default::default()
    };
    let mut engine = Engine::new(config, TargetData::default());
    let root = engine.root();
    engine.set_current_node(&root, 50);

    // alloca %x; store 3 -> %x; %v = load %x; %c = icmp slt %v, 5; br %c
    let x = alloca(1, "x", 4, 32);
    engine
        .execute(&x, &vec![], &[Expr::constant(0x1000, 64)], false)
        .expect("alloca");
    let st = store(2, const_value(100, 3, 32), Rc::clone(&x.result));
    engine
        .execute(
            &st,
            &vec![],
            &[Expr::constant(3, 32), Expr::constant(0x1000, 64)],
            false,
        )
        .expect("store");
    let ld = load(3, "v", 32, Rc::clone(&x.result));
    engine
        .execute(
            &ld,
            &vec![],
            &[Expr::constant(3, 32), Expr::constant(0x1000, 64)],
            false,
        )
        .expect("load");
    let cmp = Instruction::new(
        4,
        Opcode::ICmp(IntPredicate::Slt),
        instr_value(4, "c", int_ty(1)),
        vec![Rc::clone(&ld.result), const_value(101, 5, 32)],
        "main",
    );
    engine
        .execute(
            &cmp,
            &vec![],
            &[
                Expr::bool_const(true),
                Expr::constant(3, 32),
                Expr::constant(5, 32),
            ],
            false,
        )
        .expect("icmp");
    let br = Instruction::new(
        5,
        Opcode::Br { conditional: true },
        void_result(5),
        vec![Rc::clone(&cmp.result)],
        "main",
    );
    engine.record_branch_direction(&br, true);

    engine.remove(&root);

    // The WP of [.. store x := 3; br (x < 5) taken] pushes up to true.
    let entry = &engine.subsumption_table().entries_at(50)[0];
    let wp = entry.wp_interpolant().expect("wp interpolant");
    assert!(wp.is_true());
}

// ===== WP instantiation at a subsumption point =====

#[test]
fn wp_variable_instantiates_from_store() {
    use itp_engine::wp::{instantiate_wp_expression, WpArrayStore};
    use itp_engine::memory::AllocationContext;

    let mut engine = engine();
    let x = alloca(1, "x", 4, 32);
    engine
        .execute(&x, &vec![], &[Expr::constant(0x1000, 64)], false)
        .expect("alloca");
    let st = store(2, const_value(100, 7, 32), Rc::clone(&x.result));
    engine
        .execute(
            &st,
            &vec![],
            &[Expr::constant(7, 32), Expr::constant(0x1000, 64)],
            false,
        )
        .expect("store");

    let mut wp_store = WpArrayStore::new(Rc::clone(engine.arrays()));
    let var = wp_store
        .create_and_insert(
            AllocationContext::new(&x.result, vec![]),
            "x",
            32,
            32,
            None,
        )
        .expect("wp variable");
    let wp = Expr::cmp(CmpOp::Slt, var, Expr::constant(9, 32));

    let dependency = engine.current().borrow().dependency();
    let instantiated = instantiate_wp_expression(&dependency, &wp, &wp_store);
    // x's latest stored value (7) replaces the variable: 7 < 9 folds true.
    assert!(instantiated.is_true());
}

// ===== Interpolation disabled =====

#[test]
fn disabled_interpolation_is_inert() {
    let config = InterpConfig {
        interpolation_enabled: false,
        ..Default::default()
    };
    let mut engine = Engine::new(config, TargetData::default());
    let a = alloca(1, "a", 4, 32);
    assert!(engine
        .execute(&a, &vec![], &[Expr::constant(0x1000, 64)], false)
        .expect("noop")
        .is_none());
    let mut solver = ScriptedSolver::valid(vec![]);
    assert!(!engine.check_current_state_subsumption(&mut solver, &[], TIMEOUT));
}
