/// Tag describing what should happen to a staged row at commit time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Crud {
    Create,
    Read,
    Update,
    Delete,
}

impl Crud {
    /// Fold a newly reported tag into the tag already staged for the same
    /// (entity type, id).
    ///
    /// A second `Create` over any existing tag folds to `Update`: the handler
    /// cannot have known whether the row already existed, so the commit must
    /// upsert rather than insert.
    pub fn fold(prev: Option<Crud>, next: Crud) -> Crud {
        let prev = match prev {
            None => return next,
            Some(prev) => prev,
        };
        match (prev, next) {
            (_, Crud::Create) => Crud::Update,
            (prev, Crud::Read) => prev,
            (Crud::Create, Crud::Update) => Crud::Create,
            (_, Crud::Update) => Crud::Update,
            (_, Crud::Delete) => Crud::Delete,
        }
    }

    /// True for tags that persist a row value at commit time.
    pub fn writes_value(self) -> bool {
        matches!(self, Crud::Create | Crud::Update)
    }
}
