/// The fixed roster of participating nodes, learned once at `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peers {
    pub local: String,
    pub members: Vec<String>,
}

impl Peers {
    pub fn new(local: impl Into<String>, members: Vec<String>) -> Self {
        let local = local.into();
        let mut members = members;
        if !members.contains(&local) {
            members.push(local.clone());
        }

        Peers { local, members }
    }

    /// Every member except the local node, in roster order.
    pub fn others(&self) -> impl Iterator<Item = &str> {
        self.members
            .iter()
            .map(String::as_str)
            .filter(move |member| *member != self.local)
    }

    pub fn is_member(&self, id: &str) -> bool {
        self.members.iter().any(|member| member == id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
