#![no_main]
use arbitrary::{Arbitrary, Unstructured};
use kmem::{BuddyConfig, MAX_ORDER};
use kmem_hater::{AllocatorOp, BuddySubject, Evaluator, BASE_PAGE};
use libfuzzer_sys::fuzz_target;

const MAX_NUM_PAGES: usize = 1000;

#[derive(Clone, Debug)]
struct Args {
    config: BuddyConfig,
    ops: Vec<AllocatorOp<()>>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let total_pages = usize::arbitrary(un)? % MAX_NUM_PAGES;
        let min_order = u32::arbitrary(un)? % 4;
        let max_order = u32::arbitrary(un)? % (MAX_ORDER + 1);
        let reserved = usize::arbitrary(un)? % (total_pages + 1);

        let config = BuddyConfig::new(BASE_PAGE, total_pages)
            .with_orders(min_order, max_order)
            .with_kernel_reserved(reserved);
        let ops = Vec::arbitrary(un)?;

        Ok(Args { config, ops })
    }
}

fuzz_target!(|args: Args| {
    // Invalid configurations are rejected at init.
    let buddy = match BuddySubject::new(args.config) {
        Ok(b) => b,
        Err(_) => return,
    };

    let mut eval = Evaluator::new(buddy);
    eval.evaluate(args.ops).unwrap();
});
