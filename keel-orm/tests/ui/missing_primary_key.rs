use keel_orm::Model;

#[derive(Model)]
struct Orphan {
    id: i32,
    name: String,
}

fn main() {}
