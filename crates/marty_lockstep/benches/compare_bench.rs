/*
    MartyPC
    https://github.com/dbalsom/martypc

    Copyright 2022-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    ---------------------------------------------------------------------------

    benches::compare_bench.rs

    Benchmarks for register comparison and undefined flag masking.

*/

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use marty_lockstep::{
    compare::compare_cpus,
    memory::ProtMapping,
    mock::{program, MockReference},
    snapshot::start_reference,
    tracelogger::TraceLogger,
    udmask::{mask_for_instruction, X86UndefinedFlags},
    LockstepSession,
    NullDebugger,
    SessionOptions,
};

pub fn compare_bench(c: &mut Criterion) {
    let mut primary = program(0x1000, &[0x90], 0x2000, 0x3000);
    let mut reference: MockReference = start_reference(&primary, ProtMapping::ReadImpliesExec).unwrap();
    let mut trace = TraceLogger::None;

    c.bench_function("compare_cpus", |b| {
        b.iter(|| {
            compare_cpus(
                &mut primary,
                &mut reference,
                black_box(0),
                0,
                &mut NullDebugger,
                &mut trace,
            )
            .unwrap()
        });
    });
}

pub fn udmask_bench(c: &mut Criterion) {
    // SHL dword [ebx+esi*4+10h], 2
    let instr = [0xC1, 0x64, 0xB3, 0x10, 0x02];

    c.bench_function("mask_for_instruction", |b| {
        b.iter(|| mask_for_instruction(black_box(&instr), 0));
    });
}

pub fn session_bench(c: &mut Criterion) {
    // INC EAX, repeated for the whole page.
    let code = vec![0x40; 4096];

    c.bench_function("lockstep_iterate", |b| {
        b.iter_batched(
            || {
                let primary = program(0x1000, &code, 0x8000, 0x9000);
                LockstepSession::<_, MockReference, _, _>::start(
                    primary,
                    X86UndefinedFlags,
                    NullDebugger,
                    SessionOptions::default(),
                )
                .unwrap()
            },
            |mut session| {
                for _ in 0..1000 {
                    session.iterate().unwrap();
                }
                session
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, compare_bench, udmask_bench, session_bench);
criterion_main!(benches);
