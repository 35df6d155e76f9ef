use crate::state::ActorId;

/// Resolves the acting faction for an operation with no intrinsic actor.
///
/// Returns the single non-null owner when every non-null owner agrees,
/// otherwise `None` (no owners, or a contested border).
pub fn unanimous_owner<I>(owners: I) -> Option<ActorId>
where
    I: IntoIterator<Item = Option<ActorId>>,
{
    let mut resolved = None;
    for owner in owners.into_iter().flatten() {
        match resolved {
            None => resolved = Some(owner),
            Some(existing) if existing != owner => return None,
            Some(_) => {}
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreeing_owners_resolve_and_nulls_are_ignored() {
        let a = ActorId(1);
        assert_eq!(unanimous_owner([Some(a), None, Some(a)]), Some(a));
        assert_eq!(unanimous_owner([None, None]), None);
        assert_eq!(unanimous_owner(std::iter::empty()), None);
    }

    #[test]
    fn contested_owners_resolve_to_none() {
        assert_eq!(unanimous_owner([Some(ActorId(1)), Some(ActorId(2))]), None);
    }
}
