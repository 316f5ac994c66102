use keel_orm::Model;

#[derive(Model)]
#[orm(many_to_many(name = "friends", model = "Person", through = "friendships"))]
struct Person {
    #[orm(primary_key)]
    id: i32,
}

fn main() {}
