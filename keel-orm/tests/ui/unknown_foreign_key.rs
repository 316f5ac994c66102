use keel_orm::Model;

#[derive(Model)]
#[orm(belongs_to(model = "Team", foreign_key = "missing_col"))]
struct Player {
    #[orm(primary_key)]
    id: i32,
}

fn main() {}
