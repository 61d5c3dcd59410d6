// Curated word lists shared by character extraction, prompt analysis and enrichment.

pub const SPECIES: &[&str] = &[
    "fox", "rabbit", "bunny", "bear", "cat", "kitten", "dog", "puppy", "owl", "mouse", "deer",
    "fawn", "wolf", "lion", "tiger", "elephant", "giraffe", "monkey", "penguin", "duck",
    "duckling", "frog", "turtle", "tortoise", "squirrel", "hedgehog", "badger", "raccoon",
    "otter", "beaver", "horse", "pony", "unicorn", "dragon", "dinosaur", "bird", "robin",
    "sparrow", "parrot", "eagle", "hen", "chicken", "chick", "pig", "piglet", "cow", "sheep",
    "lamb", "goat", "koala", "panda", "kangaroo", "zebra", "hippo", "whale", "dolphin", "fish",
    "octopus", "crab", "butterfly", "bee", "ladybug", "snail", "caterpillar", "dragonfly",
    "robot", "fairy", "elf", "gnome", "troll", "witch", "wizard", "princess",
    "prince", "king", "queen", "knight", "pirate", "girl", "boy", "child",
    "grandmother", "grandfather", "mermaid", "alien", "ghost", "snowman", "bat", "seal",
    "moose", "lizard", "snake", "spider", "ant",
];

pub const SIZES: &[&str] = &[
    "tiny", "small", "little", "big", "large", "huge", "giant", "tall", "short", "chubby",
    "plump", "slender", "fluffy", "round", "young", "old", "baby",
];

pub const COLORS: &[&str] = &[
    "red", "orange", "yellow", "green", "blue", "purple", "pink", "brown", "black", "white",
    "gray", "grey", "golden", "silver", "violet", "teal", "turquoise", "crimson", "ginger",
    "tawny", "cream", "spotted", "striped", "rainbow",
];

pub const CLOTHING: &[&str] = &[
    "scarf", "hat", "cap", "coat", "jacket", "cloak", "cape", "dress", "shirt", "sweater",
    "vest", "boots", "shoes", "glasses", "bow", "ribbon", "crown", "backpack", "apron",
    "overalls", "raincoat", "bandana", "necklace", "mittens", "gloves", "skirt", "tie",
    "helmet", "armor", "belt",
];

pub const ACTIONS: &[&str] = &[
    "walking", "walks", "walk", "running", "runs", "run", "jumping", "jumps", "jump",
    "hopping", "hops", "flying", "flies", "fly", "swimming", "swims", "climbing", "climbs",
    "reading", "reads", "playing", "plays", "dancing", "dances", "singing", "sings",
    "sleeping", "sleeps", "eating", "eats", "exploring", "explores", "looking", "looks",
    "hiding", "hides", "sitting", "sits", "standing", "stands", "holding", "holds",
    "hugging", "hugs", "waving", "waves", "laughing", "laughs", "crying", "cries",
    "searching", "searches", "building", "builds", "painting", "paints", "carrying",
    "carries", "sharing", "shares", "helping", "helps", "chasing", "chases", "peeking",
    "peeks", "gazing", "gazes", "floating", "floats", "sailing", "sails", "riding", "rides",
    "baking", "bakes", "picking", "picks", "watching", "watches", "discovering", "discovers",
];

pub const MOODS: &[&str] = &[
    "happy", "joyful", "cheerful", "sad", "lonely", "scared", "frightened", "brave",
    "curious", "excited", "peaceful", "calm", "cozy", "magical", "mysterious", "playful",
    "gentle", "warm", "serene", "dreamy", "whimsical", "proud", "shy", "sleepy", "hopeful",
    "adventurous", "surprised", "worried", "determined", "delighted", "friendly", "festive",
];

/// First words that mark a prompt opening with scenery rather than a character name.
pub const SCENE_STARTERS: &[&str] = &[
    "a", "an", "the", "in", "on", "at", "with", "under", "inside", "outside",
];

/// Clauses starting with these describe behaviour, not looks.
pub const BEHAVIORAL: &[&str] = &[
    "loves", "likes", "enjoys", "wants", "hates", "dreams", "prefers", "adores", "always",
    "often", "never", "is", "who", "can", "knows",
];

pub const PREPOSITIONS: &[&str] = &[
    "in", "on", "at", "under", "inside", "outside", "through", "near", "beside", "by",
    "across", "over", "into", "among", "along", "behind", "beneath", "atop", "around",
];

pub fn contains(list: &[&str], word: &str) -> bool {
    list.contains(&word)
}

/// Species match that tolerates a simple plural ("foxes", "bears").
pub fn species_of(word: &str) -> Option<&'static str> {
    let word = word.to_lowercase();
    SPECIES.iter().copied().find(|s| {
        word == *s
            || word.strip_suffix('s') == Some(*s)
            || word.strip_suffix("es") == Some(*s)
    })
}
