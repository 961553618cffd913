//! End-to-end smoke test: the allocator installed as the global allocator
//! of the test binary, serving every allocation the harness and the tests
//! themselves make.

#[global_allocator]
static ALLOCATOR: bitmalloc::Allocator = bitmalloc::Allocator::new();

#[test]
fn vec() {
    let mut v = vec![1, 2, 3];
    v.push(4);

    assert_eq!((1..=4).collect::<Vec<_>>(), v);
}

#[test]
fn map_and_formatting() {
    let mut map = std::collections::BTreeMap::new();
    map.insert(10, "Hello");
    map.insert(11, "world");
    map.insert(20, "Hallo");
    map.insert(21, "Welt");
    map.insert(-1, "english");
    map.insert(-2, "german");

    let english = format!("[{}]: {}, {}!", map[&-1], map[&10], map[&11]);
    let german = format!("[{}]: {}, {}!", map[&-2], map[&20], map[&21]);
    assert_eq!(english, "[english]: Hello, world!");
    assert_eq!(german, "[german]: Hallo, Welt!");
}

#[test]
fn growth_across_every_size_band() {
    // From single bytes through packed regions up to whole-block runs.
    let mut buffers: Vec<Vec<u8>> = Vec::new();
    for size in [1, 2, 3, 7, 8, 31, 100, 400, 500, 4096, 100_000] {
        let mut buffer = Vec::with_capacity(size);
        buffer.resize(size, 0xab);
        buffers.push(buffer);
    }
    for buffer in &buffers {
        assert!(buffer.iter().all(|&b| b == 0xab));
    }
}

#[test]
fn churn_keeps_data_intact() {
    let mut strings: Vec<String> = Vec::new();
    for round in 0..50usize {
        strings.push(format!("round {round} payload {}", "x".repeat(round)));
        if round % 3 == 0 {
            strings.swap_remove(round / 2);
        }
    }
    for s in &strings {
        assert!(s.starts_with("round "));
    }
}

#[test]
fn threads_share_the_heap() {
    let handles: Vec<_> = (0..4)
        .map(|t| {
            std::thread::spawn(move || {
                let mut local = Vec::new();
                for i in 0..200usize {
                    local.push(vec![t as u8; 1 + (i * 7) % 96]);
                }
                local.iter().map(Vec::len).sum::<usize>()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap() > 0);
    }
}
