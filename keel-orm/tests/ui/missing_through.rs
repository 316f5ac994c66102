use keel_orm::Model;

#[derive(Model)]
#[orm(many_to_many(model = "Tag"))]
struct Post {
    #[orm(primary_key)]
    id: i32,
}

fn main() {}
