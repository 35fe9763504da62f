/// English function words left alone unless stopword replacement is enabled.
const STOPWORDS: &[&str] = &[
    "a", "about", "above", "across", "after", "afterwards", "again", "against", "ain", "all",
    "almost", "alone", "along", "already", "also", "although", "am", "among", "amongst", "an",
    "and", "another", "any", "anyhow", "anyone", "anything", "anyway", "anywhere", "are", "aren",
    "around", "as", "at", "back", "be", "became", "because", "become", "becomes", "becoming",
    "been", "before", "beforehand", "behind", "being", "below", "beside", "besides", "between",
    "beyond", "both", "but", "by", "can", "cannot", "could", "couldn", "d", "didn", "do", "does",
    "doesn", "doing", "don", "done", "down", "due", "during", "either", "else", "elsewhere",
    "empty", "enough", "even", "ever", "everyone", "everything", "everywhere", "except", "first",
    "for", "former", "formerly", "from", "hadn", "hasn", "haven", "having", "he", "hence", "her",
    "here", "hereafter", "hereby", "herein", "hereupon", "hers", "herself", "him", "himself",
    "his", "how", "however", "hundred", "i", "if", "in", "indeed", "into", "is", "isn", "it",
    "its", "itself", "just", "latter", "latterly", "least", "ll", "may", "me", "meanwhile",
    "mightn", "mine", "more", "moreover", "most", "mostly", "must", "mustn", "my", "myself",
    "namely", "needn", "neither", "never", "nevertheless", "next", "no", "nobody", "none",
    "noone", "nor", "not", "nothing", "now", "nowhere", "o", "of", "off", "on", "once", "one",
    "only", "onto", "or", "other", "others", "otherwise", "our", "ours", "ourselves", "out",
    "over", "per", "please", "s", "same", "shan", "she", "should", "shouldn", "somehow",
    "something", "sometime", "somewhere", "such", "t", "than", "that", "the", "their", "theirs",
    "them", "themselves", "then", "thence", "there", "thereafter", "thereby", "therefore",
    "therein", "thereupon", "these", "they", "this", "those", "through", "throughout", "thru",
    "thus", "to", "too", "toward", "towards", "under", "unless", "until", "up", "upon", "used",
    "ve", "was", "wasn", "we", "were", "weren", "what", "whatever", "when", "whence", "whenever",
    "where", "whereafter", "whereas", "whereby", "wherein", "whereupon", "wherever", "whether",
    "which", "while", "whither", "who", "whoever", "whole", "whom", "whose", "why", "with",
    "within", "without", "won", "would", "wouldn", "y", "yet", "you", "your", "yours",
    "yourself", "yourselves",
];

#[must_use]
pub fn is_stopword(word: &str) -> bool {
    let lower = word.to_lowercase();
    STOPWORDS.binary_search(&lower.as_str()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_is_sorted_for_binary_search() {
        assert!(STOPWORDS.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn case_insensitive() {
        assert!(is_stopword("The"));
        assert!(is_stopword("however"));
        assert!(!is_stopword("movie"));
    }
}
