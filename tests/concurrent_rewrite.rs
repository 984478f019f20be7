//! Instrumenting code units while other threads allocate, with the tracer as
//! the global allocator.

use std::{
    sync::mpsc,
    thread::spawn,
    time::Duration,
};

use memtrace::{
    ir::{Expr, JumpKind, Stmt},
    rewrite, with_tracer, Block, TraceAllocator,
};

#[global_allocator]
static GLOBAL: TraceAllocator = TraceAllocator;

const ROUNDS: usize = 200;

#[inline(never)]
fn first_function(v: &mut Vec<u64>) {
    v.push(1);
}

#[inline(never)]
fn second_function(v: &mut Vec<u64>) {
    v.push(2);
}

// A code unit marking instructions of real functions, so that rewriting
// them looks up symbols.
fn block() -> Block {
    let mut block = Block::new(Expr::addr(0), JumpKind::Ret);
    for f in &[first_function as fn(&mut Vec<u64>), second_function] {
        block.push(Stmt::IMark {
            addr: *f as usize as u64,
            len: 4,
        });
    }
    block
}

fn rewriter() {
    for _ in 0..ROUNDS {
        let out = rewrite(&block());
        assert!(out.stmts.len() >= 2);
    }
}

fn allocator() {
    for i in 0..ROUNDS {
        let mut v = Vec::new();
        first_function(&mut v);
        second_function(&mut v);
        v.extend(0..i as u64);
        let address = v.as_ptr() as usize;
        assert_eq!(with_tracer(|t| t.is_tracked(address)), Some(true));
    }
}

// Runs every job on its own thread and fails if they have not all finished
// within a minute.
fn finish_in_time(jobs: Vec<fn()>) {
    let (tx, rx) = mpsc::channel();
    let count = jobs.len();
    for job in jobs {
        let tx = tx.clone();
        spawn(move || {
            job();
            let _ = tx.send(());
        });
    }
    for _ in 0..count {
        rx.recv_timeout(Duration::from_secs(60))
            .expect("tracer threads did not finish");
    }
}

#[test]
fn rewrites_alongside_allocations() {
    finish_in_time(vec![rewriter, allocator]);
}

#[test]
fn concurrent_rewrites() {
    finish_in_time(vec![rewriter, rewriter, rewriter, rewriter]);
}
