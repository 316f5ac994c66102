use keel_orm::Model;

#[derive(Model)]
struct Pair {
    #[orm(primary_key)]
    left: i32,
    #[orm(primary_key)]
    right: i32,
}

fn main() {}
