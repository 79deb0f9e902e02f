use std::rc::Rc;

use super::{Node, Patch, Path, Step};

/// Computes the minimal structural edits turning `old` into `new`.
///
/// Branches whose `Rc` identity is unchanged are skipped without descending,
/// so the cost is proportional to the touched spine rather than the tree
/// size. Container patches are emitted per changed child; a kind change
/// replaces the whole subtree with one `Set`.
pub fn diff(old: &Node, new: &Node) -> Vec<Patch> {
    let mut patches = Vec::new();
    let mut steps = Vec::new();
    diff_at(&mut steps, old, new, &mut patches);
    patches
}

/// Cheap identity check: equal scalars, or containers sharing an `Rc`.
///
/// Pending wrappers are never identical so an annotation always shows up as
/// a patch.
pub(crate) fn same_rep(old: &Node, new: &Node) -> bool {
    match (old, new) {
        (Node::Null, Node::Null) => true,
        (Node::Bool(a), Node::Bool(b)) => a == b,
        (Node::Int(a), Node::Int(b)) => a == b,
        (Node::Float(a), Node::Float(b)) => a == b,
        (Node::Str(a), Node::Str(b)) => Rc::ptr_eq(a, b) || a == b,
        (Node::Seq(a), Node::Seq(b)) => Rc::ptr_eq(a, b),
        (Node::Map(a), Node::Map(b)) => Rc::ptr_eq(a, b),
        _ => false,
    }
}

fn diff_at(steps: &mut Vec<Step>, old: &Node, new: &Node, patches: &mut Vec<Patch>) {
    if same_rep(old, new) {
        return;
    }
    match (old, new) {
        (Node::Map(a), Node::Map(b)) => {
            for (key, new_child) in b.iter() {
                steps.push(Step::Key(key.as_str().into()));
                match a.get(key) {
                    Some(old_child) => diff_at(steps, old_child, new_child, patches),
                    None => patches.push(Patch::set(
                        Path::from_steps(steps.clone()),
                        new_child.clone(),
                    )),
                }
                steps.pop();
            }
            for key in a.keys() {
                if !b.contains_key(key) {
                    steps.push(Step::Key(key.as_str().into()));
                    patches.push(Patch::remove(Path::from_steps(steps.clone())));
                    steps.pop();
                }
            }
        }
        (Node::Seq(a), Node::Seq(b)) => {
            let common = a.len().min(b.len());
            for i in 0..common {
                steps.push(Step::Index(i));
                diff_at(steps, &a[i], &b[i], patches);
                steps.pop();
            }
            for (i, new_child) in b.iter().enumerate().skip(common) {
                steps.push(Step::Index(i));
                patches.push(Patch::set(
                    Path::from_steps(steps.clone()),
                    new_child.clone(),
                ));
                steps.pop();
            }
            // Emit tail removals highest-index first so applying them in
            // order stays valid.
            for i in (common..a.len()).rev() {
                steps.push(Step::Index(i));
                patches.push(Patch::remove(Path::from_steps(steps.clone())));
                steps.pop();
            }
        }
        _ => patches.push(Patch::set(Path::from_steps(steps.clone()), new.clone())),
    }
}
