#![no_main]
use arbitrary::{Arbitrary, Unstructured};
use kmem_hater::{AllocatorOp, Evaluator, KmemOp, KmemSubject};
use libfuzzer_sys::fuzz_target;

const MAX_NUM_PAGES: usize = 512;

#[derive(Clone, Debug)]
struct Args {
    num_pages: usize,
    ops: Vec<AllocatorOp<KmemOp>>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let num_pages = 1 + usize::arbitrary(un)? % MAX_NUM_PAGES;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { num_pages, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { num_pages, ops } = args;

    let kmem = match KmemSubject::new(num_pages) {
        Ok(k) => k,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(kmem);
    eval.evaluate(ops).unwrap();
});
