/// Declaration mistakes in `#[derive(Model)]` fail the build instead of
/// panicking the first time `schema()` runs.
#[test]
fn invalid_models_do_not_compile() {
    let t = trybuild::TestCases::new();
    t.compile_fail("tests/ui/*.rs");
}
