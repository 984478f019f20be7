//! Heap tracking and access resolution through the public API, with a fake
//! heap and an in-memory trace.

use std::{cell::RefCell, collections::HashMap};

use memtrace::{
    ir::{Block, BinOp, Expr, JumpKind, Stmt, Ty},
    parse, HelperCall, Instrumenter, LineReporter, RawAllocator, Symbolizer, TraceConfig, Tracer,
};

/// Bump allocator handing out exactly the requested size.
struct FakeHeap {
    next: RefCell<usize>,
    blocks: RefCell<HashMap<usize, usize>>,
}

impl FakeHeap {
    fn at(address: usize) -> Self {
        FakeHeap {
            next: RefCell::new(address),
            blocks: RefCell::new(HashMap::new()),
        }
    }
}

impl RawAllocator for FakeHeap {
    fn allocate(&self, align: usize, size: usize) -> Option<usize> {
        let mut next = self.next.borrow_mut();
        let address = (*next + align - 1) & !(align - 1);
        *next = address + size.max(1);
        self.blocks.borrow_mut().insert(address, size);
        Some(address)
    }

    fn usable_size(&self, address: usize) -> usize {
        self.blocks.borrow().get(&address).copied().unwrap_or(0)
    }

    unsafe fn free(&self, address: usize) {
        self.blocks.borrow_mut().remove(&address);
    }

    unsafe fn copy(&self, _dst: usize, _src: usize, _len: usize) {}

    unsafe fn zero(&self, _address: usize, _len: usize) {}
}

struct NoSymbols;

impl Symbolizer for NoSymbols {
    fn function_name(&self, _addr: u64) -> Option<String> {
        None
    }

    fn is_function_entry(&self, _addr: u64) -> bool {
        false
    }
}

type TestTracer = Tracer<FakeHeap, LineReporter<Vec<u8>>>;

fn tracer(trace_all: bool, num_callers: usize) -> TestTracer {
    let config = TraceConfig {
        trace_all,
        num_callers,
        ..TraceConfig::default()
    };
    Tracer::new(config, FakeHeap::at(0x1000), LineReporter::new(Vec::new(), num_callers))
}

fn output(tracer: &TestTracer) -> String {
    String::from_utf8(tracer.tracker().reporter().get_ref().clone()).unwrap()
}

// Access lines without the `==pid==` prefix.
fn accesses(tracer: &TestTracer) -> Vec<String> {
    output(tracer)
        .lines()
        .filter_map(|line| line.split_once("== ").map(|(_, body)| body.to_string()))
        .filter(|body| parse::parse_access(body).is_some())
        .collect()
}

// Evaluates the constant expressions the blocks below use as addresses.
fn eval(expr: &Expr) -> u64 {
    match expr {
        Expr::Const { value, .. } => *value,
        Expr::Binop {
            op: BinOp::Add,
            lhs,
            rhs,
            ..
        } => eval(lhs) + eval(rhs),
        other => panic!("cannot evaluate {:?}", other),
    }
}

fn run(tracer: &mut TestTracer, block: &Block) {
    for stmt in &block.stmts {
        if let Stmt::Helper(call) = stmt {
            tracer.dispatch(call, eval);
        }
    }
}

#[test]
fn load_inside_block_reports_offset() {
    let mut tracer = tracer(false, 0);
    let address = tracer.on_alloc(16);
    assert_eq!(address, 0x1000);

    tracer.on_load(0x1004, 4);
    assert_eq!(accesses(&tracer), vec!["Load 0x1004 4 in 0x1000+4"]);
    assert!(output(&tracer).contains("Address: 0x1000, Size: 16"));

    unsafe { tracer.on_free(address) };
    assert_eq!(tracer.tracker().resolve(0x1004), None);

    tracer.on_load(0x1004, 4);
    assert_eq!(accesses(&tracer).len(), 1);
}

#[test]
fn instrumented_increment_hits_block() {
    let mut tracer = tracer(false, 0);
    let base = tracer.on_alloc(16) as u64;

    // t0 = LD(base + 4); t1 = t0 + 1; ST(base + 4) = t1
    let field = Expr::binop(BinOp::Add, Ty::I64, Expr::addr(base), Expr::addr(4));
    let mut block = Block::new(Expr::addr(0x400010), JumpKind::Boring);
    let t0 = block.new_tmp(Ty::I32);
    let t1 = block.new_tmp(Ty::I32);
    block.push(Stmt::IMark {
        addr: 0x400000,
        len: 7,
    });
    block.push(Stmt::WrTmp {
        tmp: t0,
        data: Expr::load(Ty::I32, field.clone()),
    });
    block.push(Stmt::WrTmp {
        tmp: t1,
        data: Expr::binop(BinOp::Add, Ty::I32, Expr::Tmp(t0), Expr::constant(1, Ty::I32)),
    });
    block.push(Stmt::Store {
        addr: field,
        data: Expr::Tmp(t1),
    });
    // Outside the block.
    block.push(Stmt::IMark {
        addr: 0x400007,
        len: 4,
    });
    block.push(Stmt::Store {
        addr: Expr::addr(base + 16),
        data: Expr::Tmp(t1),
    });

    let mut instrumenter = Instrumenter::new(tracer.config(), NoSymbols);
    let instrumented = instrumenter.instrument(&block).unwrap();
    run(&mut tracer, &instrumented);

    assert_eq!(accesses(&tracer), vec!["Modify 0x1004 4 in 0x1000+4"]);
}

#[test]
fn trace_all_prints_every_access() {
    let mut tracer = tracer(true, 0);
    tracer.on_alloc(8);

    let mut block = Block::new(Expr::addr(0x400010), JumpKind::Boring);
    let t0 = block.new_tmp(Ty::I64);
    block.push(Stmt::IMark {
        addr: 0x400000,
        len: 4,
    });
    block.push(Stmt::WrTmp {
        tmp: t0,
        data: Expr::load(Ty::I64, Expr::addr(0x1000)),
    });
    block.push(Stmt::Exit {
        guard: Expr::constant(0, Ty::I1),
        target: 0x500000,
        jump: JumpKind::Boring,
    });
    block.push(Stmt::Store {
        addr: Expr::addr(0x7000),
        data: Expr::Tmp(t0),
    });

    let mut instrumenter = Instrumenter::new(tracer.config(), NoSymbols);
    let instrumented = instrumenter.instrument(&block).unwrap();
    run(&mut tracer, &instrumented);

    // Instruction fetches are only printed with --trace-instr.
    assert_eq!(
        accesses(&tracer),
        vec!["Load 0x1000 8", "Store 0x7000 8"]
    );
}

#[test]
fn realloc_moves_tracking() {
    let mut tracer = tracer(false, 0);
    let old = tracer.on_alloc(8);
    let new = unsafe { tracer.on_realloc(old, 64) };
    assert_ne!(new, old);

    tracer.on_store(old + 4, 4);
    tracer.on_store(new + 40, 4);
    assert_eq!(
        accesses(&tracer),
        vec![format!("Store {:#x} 4 in {:#x}+40", new + 40, new)]
    );
    assert_eq!(tracer.tracker().table().pool().live(), 1);
}

#[test]
fn trace_log_round_trip() {
    let mut tracer = tracer(false, 4);
    let first = tracer.on_alloc(16);
    let second = tracer.on_alloc(32);
    tracer.on_function("main");
    tracer.on_load(first + 8, 8);
    tracer.on_store(second, 4);
    tracer.on_modify(first + 15, 1);

    let log = output(&tracer);
    let allocations = parse::collect_allocations(log.as_bytes()).unwrap();
    assert_eq!(allocations.len(), 2);
    assert_eq!((allocations[0].address, allocations[0].size), (first, 16));
    assert_eq!((allocations[1].address, allocations[1].size), (second, 32));
    assert!(allocations.iter().all(|info| info.stack.len() <= 4));

    let mut out = Vec::new();
    let copied = parse::trace_allocation(log.as_bytes(), &mut out, &allocations[0]).unwrap();
    assert_eq!(copied, 2);
    let out = String::from_utf8(out).unwrap();
    assert_eq!(out.lines().count(), 3);
    assert!(out.lines().next().unwrap().ends_with("Function main"));
}

#[test]
fn guarded_calls_follow_their_guard() {
    let mut tracer = tracer(true, 0);
    let call = |guard: u64| HelperCall::Access {
        kind: memtrace::EventKind::Write,
        addr: Expr::addr(0x2000),
        size: 2,
        guard: Some(Expr::constant(guard, Ty::I1)),
    };
    tracer.dispatch(&call(0), eval);
    tracer.dispatch(&call(1), eval);
    assert_eq!(accesses(&tracer), vec!["Store 0x2000 2"]);
}
