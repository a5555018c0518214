use crate::buf::LabelCache;

/// Upper bound on the encoded size of a name given the current label cache.
/// Writing the name afterwards comes in at or below this bound, since
/// encoding may add compression opportunities of its own.
pub(crate) fn encoded_name_len(name: &str, label_cache: Option<&LabelCache>) -> usize {
    let labels: Vec<&str> = name.split('.').filter(|label| !label.is_empty()).collect();
    let mut size = 0;
    for (idx, label) in labels.iter().enumerate() {
        if let Some(cache) = label_cache {
            if cache.contains_key(&labels[idx..].join(".")) {
                return size + 2;
            }
        }
        size += 1 + label.len();
    }
    size + 1
}
