#![no_main]
use arbitrary::{Arbitrary, Unstructured};
use kmem_hater::{AllocatorOp, Evaluator, SlabSubject};
use libfuzzer_sys::fuzz_target;

const MAX_NUM_PAGES: usize = 256;
const MAX_OBJECT_SIZE: usize = 4096;

#[derive(Clone, Debug)]
struct Args {
    num_pages: usize,
    object_size: usize,
    align: usize,
    ops: Vec<AllocatorOp<()>>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let num_pages = 1 + usize::arbitrary(un)? % MAX_NUM_PAGES;
        let object_size = usize::arbitrary(un)? % MAX_OBJECT_SIZE;

        // Select a random bit index and shift to obtain a power of two.
        let align = 1 << (u8::arbitrary(un)? % 13);
        let ops = Vec::arbitrary(un)?;

        Ok(Args {
            num_pages,
            object_size,
            align,
            ops,
        })
    }
}

fuzz_target!(|args: Args| {
    let Args {
        num_pages,
        object_size,
        align,
        ops,
    } = args;

    // Sizes which cannot form a slab are rejected at creation.
    let slab = match SlabSubject::new(num_pages, object_size, align) {
        Ok(s) => s,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(slab);
    eval.evaluate(ops).unwrap();
});
