//
// reconcile.rs
//
// Carry run status over from a previous test item list to a republished one
//

use crate::protocol::{TestItemDetail, TestRunResult};

/// Copy the status of previously known items into `new_status`.
///
/// Every previous item (in previous order) is compared against the new items
/// in new order; the first new item with the same `id` receives the previous
/// status and the scan for that previous item stops. Items carrying an error
/// take no part in matching on either side, so a broken new item keeps its
/// `Invalid` status and a fixed item starts over. Ids are not unique, so a
/// later previous item sharing an id with an earlier one overwrites the same
/// new slot.
pub fn carry_over_status(
    previous_items: &[TestItemDetail],
    previous_status: &[TestRunResult],
    new_items: &[TestItemDetail],
    new_status: &mut [TestRunResult],
) {
    debug_assert_eq!(previous_items.len(), previous_status.len());
    debug_assert_eq!(new_items.len(), new_status.len());

    for (previous, status) in previous_items.iter().zip(previous_status) {
        if !previous.is_runnable() {
            continue;
        }
        for (new_idx, new_item) in new_items.iter().enumerate() {
            if !new_item.is_runnable() {
                continue;
            }
            if previous.id == new_item.id {
                new_status[new_idx] = status.clone();
                break;
            }
        }
    }
}
