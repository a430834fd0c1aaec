#[cfg(test)]
#[ctor::ctor]
fn init_tests() {
    // one subscriber for the whole test binary, output captured per test
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .try_init();
}
